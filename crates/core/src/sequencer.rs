//! Plays song parts back to back in canonical order.
//!
//! Every part with at least one clip is queued. A part plays all of its clips
//! at once and hands over to the next part once its longest clip has run.
//! Advances are deadlines on the context clock, checked by
//! [`PartSequencer::poll`].

use beatlayer_transport::{AudioClip, SongPart};

use crate::cache::BufferCache;
use crate::clip_player::ClipPlayer;
use crate::graph_manager::GraphManager;

#[derive(Debug, Clone, PartialEq)]
pub enum SequencerState {
    Idle,
    Playing { queue: Vec<SongPart>, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerEvent {
    Advanced(SongPart),
    Finished,
}

/// Parts that have clips, in canonical order.
pub fn build_queue(clips: &[AudioClip]) -> Vec<SongPart> {
    SongPart::ORDER
        .into_iter()
        .filter(|part| clips.iter().any(|clip| clip.song_part == *part))
        .collect()
}

/// Longest declared duration among a part's clips.
fn part_length(clips: &[AudioClip], part: SongPart) -> f64 {
    clips
        .iter()
        .filter(|clip| clip.song_part == part)
        .map(|clip| clip.duration)
        .filter(|duration| duration.is_finite())
        .fold(0.0, f64::max)
}

#[derive(Debug)]
pub struct PartSequencer {
    state: SequencerState,
    /// Context time at which the current part hands over.
    deadline: Option<f64>,
}

impl Default for PartSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartSequencer {
    pub fn new() -> Self {
        Self {
            state: SequencerState::Idle,
            deadline: None,
        }
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state, SequencerState::Playing { .. })
    }

    pub fn current_part(&self) -> Option<SongPart> {
        match &self.state {
            SequencerState::Playing { queue, index } => queue.get(*index).copied(),
            SequencerState::Idle => None,
        }
    }

    pub fn deadline(&self) -> Option<f64> {
        self.deadline
    }

    /// Queue every part that has clips and play the first. Returns false when
    /// there is nothing to play.
    pub fn start(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        player: &mut ClipPlayer,
        clips: &mut [AudioClip],
    ) -> bool {
        if self.is_playing() {
            self.stop(graph, player, clips);
        }
        let queue = build_queue(clips);
        if queue.is_empty() {
            log::debug!("no parts with clips to sequence");
            return false;
        }
        log::info!(
            "sequencing {}",
            queue.iter().map(SongPart::name).collect::<Vec<_>>().join(" -> ")
        );
        self.state = SequencerState::Playing { queue, index: 0 };
        self.play_current(graph, cache, player, clips);
        true
    }

    fn play_current(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        player: &mut ClipPlayer,
        clips: &mut [AudioClip],
    ) {
        let Some(part) = self.current_part() else {
            self.reset();
            return;
        };
        player.play_part(graph, cache, clips, part);
        let length = part_length(clips, part);
        let deadline = graph.current_time() + length;
        log::debug!("playing {part} for {length:.2}s");
        self.deadline = Some(deadline);
    }

    /// Forget the queue without touching playback.
    pub fn reset(&mut self) {
        self.state = SequencerState::Idle;
        self.deadline = None;
    }

    /// Advance if the current part's time is up.
    pub fn poll(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        player: &mut ClipPlayer,
        clips: &mut [AudioClip],
    ) -> Option<SequencerEvent> {
        let deadline = self.deadline?;
        if graph.current_time() < deadline {
            return None;
        }
        let SequencerState::Playing { queue, index } = &mut self.state else {
            self.deadline = None;
            return None;
        };
        *index += 1;
        match queue.get(*index).copied() {
            Some(part) => {
                log::info!("advancing to {part}");
                self.play_current(graph, cache, player, clips);
                Some(SequencerEvent::Advanced(part))
            }
            None => {
                log::info!("sequence finished");
                self.reset();
                Some(SequencerEvent::Finished)
            }
        }
    }

    /// Cancel the pending advance and pause the current part.
    pub fn stop(&mut self, graph: &mut GraphManager, player: &mut ClipPlayer, clips: &mut [AudioClip]) {
        if let Some(part) = self.current_part() {
            player.pause_part(graph, clips, part);
        }
        self.reset();
    }
}
