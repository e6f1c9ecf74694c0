//! Per-clip playback.
//!
//! Each clip gets a [`PlaybackHandle`] the first time it is played: a media
//! element node carrying the clip's audio, routed through the clip's gain
//! (and effects chain, if any) to the destination. Handles are reused across
//! play/pause so the buffer stays warm. When the gain route cannot be built
//! the element is wired straight to the destination and volume is applied on
//! the element instead; callers see the same behaviour either way.

use std::collections::HashMap;

use beatlayer_engine::{AudioContext, GraphError, NodeId, NodeSpec, ParamKind};
use beatlayer_transport::{
    AudioArc, AudioChop, AudioClip, ClipId, DEFAULT_BPM, MAX_BPM, MAX_TRANSPOSE, MIN_BPM, SongPart,
    clamp_volume, semitone_ratio, tempo_ratio,
};

use crate::cache::BufferCache;
use crate::effects::EffectsChain;
use crate::graph_manager::GraphManager;

#[derive(Debug)]
pub struct PlaybackHandle {
    element: NodeId,
    /// `None` when routing fell back to element-level control.
    gain: Option<NodeId>,
    base_bpm: f64,
    rate: f64,
    transpose: i32,
    muted: bool,
    chain: EffectsChain,
}

impl PlaybackHandle {
    pub fn element(&self) -> NodeId {
        self.element
    }

    pub fn gain(&self) -> Option<NodeId> {
        self.gain
    }

    pub fn is_routed(&self) -> bool {
        self.gain.is_some()
    }

    pub fn base_bpm(&self) -> f64 {
        self.base_bpm
    }

    /// Tempo part of the rate, always within `[0.5, 1.5]`.
    pub fn playback_rate(&self) -> f64 {
        self.rate
    }

    pub fn transpose(&self) -> i32 {
        self.transpose
    }

    /// Rate the element actually plays at: the tempo ratio times the
    /// transpose ratio.
    pub fn effective_rate(&self) -> f64 {
        self.rate * semitone_ratio(self.transpose)
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn chain(&self) -> &EffectsChain {
        &self.chain
    }
}

/// A one-shot chop playing through its own gain.
#[derive(Debug, Clone, Copy)]
struct ChopVoice {
    source: NodeId,
    gain: NodeId,
}

pub struct ClipPlayer {
    handles: HashMap<ClipId, PlaybackHandle>,
    voices: Vec<ChopVoice>,
    smoothing: f32,
}

fn find<'a>(clips: &'a mut [AudioClip], id: &ClipId) -> Option<&'a mut AudioClip> {
    clips.iter_mut().find(|clip| clip.id == *id)
}

impl ClipPlayer {
    pub fn new(smoothing_time_constant: f32) -> Self {
        Self {
            handles: HashMap::new(),
            voices: Vec::new(),
            smoothing: smoothing_time_constant,
        }
    }

    pub fn handle(&self, id: &ClipId) -> Option<&PlaybackHandle> {
        self.handles.get(id)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Build the clip's handle if it does not exist yet. Returns false when
    /// the clip cannot be played at all.
    fn ensure_handle(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        clip: &AudioClip,
    ) -> bool {
        if self.handles.contains_key(&clip.id) {
            return true;
        }

        let context = match graph.ensure_context() {
            Ok(context) => context,
            Err(e) => {
                log::error!("cannot play clip {}: {e}", clip.id);
                return false;
            }
        };
        let buffer = match cache.load(&clip.audio_url, context.sample_rate()) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::error!("failed to load clip {} from {}: {e:#}", clip.id, clip.audio_url);
                return false;
            }
        };

        let element = match context.create(NodeSpec::MediaElement {
            element: clip.id.to_string(),
            buffer,
            volume: 1.0,
        }) {
            Ok(element) => element,
            // the element already has a graph source; reuse it rather than
            // attaching a second one
            Err(GraphError::AlreadyAttached(_)) => match context.element_node(clip.id.as_str()) {
                Some(element) => element,
                None => return false,
            },
            Err(e) => {
                log::error!("cannot create player for clip {}: {e}", clip.id);
                return false;
            }
        };

        let mut chain = EffectsChain::new();
        let volume = clamp_volume(clip.volume);
        let gain = match route_through_gain(graph, &mut chain, clip, element, volume) {
            Ok(gain) => Some(gain),
            Err(e) => {
                log::warn!("falling back to element volume for clip {}: {e}", clip.id);
                if !route_direct(graph, element, volume) {
                    if let Some(context) = graph.context_mut() {
                        let _ = context.remove(element);
                    }
                    return false;
                }
                None
            }
        };

        self.handles.insert(
            clip.id.clone(),
            PlaybackHandle {
                element,
                gain,
                base_bpm: clip.bpm,
                rate: 1.0,
                transpose: clip.transpose.clamp(-MAX_TRANSPOSE, MAX_TRANSPOSE),
                muted: false,
                chain,
            },
        );
        if let Some(handle) = self.handles.get(&clip.id)
            && handle.transpose != 0
        {
            apply_rate(graph, &clip.id, handle);
        }
        true
    }

    /// Start or resume a clip without touching any other clip.
    pub fn play(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        clips: &mut [AudioClip],
        id: &ClipId,
        looping: bool,
    ) -> bool {
        let Some(clip) = find(clips, id) else {
            log::warn!("play requested for unknown clip {id}");
            return false;
        };
        if !self.ensure_handle(graph, cache, clip) {
            return false;
        }
        let Some(handle) = self.handles.get(id) else {
            return false;
        };
        let Ok(context) = graph.ensure_context() else {
            return false;
        };
        let started = context
            .set_loop(handle.element, looping)
            .and_then(|()| context.play(handle.element));
        if let Err(e) = started {
            log::error!("failed to start clip {id}: {e}");
            return false;
        }
        clip.is_playing = true;
        clip.is_looping = looping;
        true
    }

    /// Same as [`ClipPlayer::play`]; used when several clips must sound at
    /// once.
    pub fn play_independent(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        clips: &mut [AudioClip],
        id: &ClipId,
        looping: bool,
    ) -> bool {
        self.play(graph, cache, clips, id, looping)
    }

    /// Pause and rewind every other clip, then play this one.
    pub fn play_exclusive(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        clips: &mut [AudioClip],
        id: &ClipId,
        looping: bool,
    ) -> bool {
        if let Some(context) = graph.context_mut() {
            for (other, handle) in &self.handles {
                if other != id {
                    rewind(context, handle.element);
                }
            }
        }
        for clip in clips.iter_mut() {
            if clip.id != *id {
                clip.is_playing = false;
            }
        }
        self.play(graph, cache, clips, id, looping)
    }

    pub fn pause(&mut self, graph: &mut GraphManager, clips: &mut [AudioClip], id: &ClipId) {
        if let Some(clip) = find(clips, id) {
            clip.is_playing = false;
        }
        if let (Some(handle), Some(context)) = (self.handles.get(id), graph.context_mut())
            && let Err(e) = context.pause(handle.element)
        {
            log::warn!("failed to pause clip {id}: {e}");
        }
    }

    /// Start every clip of `part` from the top with looping off, after
    /// stopping clips that belong to other parts.
    pub fn play_part(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        clips: &mut [AudioClip],
        part: SongPart,
    ) -> usize {
        if let Some(context) = graph.context_mut() {
            for clip in clips.iter().filter(|clip| clip.song_part != part) {
                if let Some(handle) = self.handles.get(&clip.id) {
                    rewind(context, handle.element);
                }
            }
        }

        let mut started = 0;
        for clip in clips.iter_mut() {
            if clip.song_part != part {
                clip.is_playing = false;
                continue;
            }
            if !self.ensure_handle(graph, cache, clip) {
                continue;
            }
            let (Some(handle), Ok(context)) = (self.handles.get(&clip.id), graph.ensure_context())
            else {
                continue;
            };
            let result = context
                .set_loop(handle.element, false)
                .and_then(|()| context.seek(handle.element, 0.0))
                .and_then(|()| context.play(handle.element));
            match result {
                Ok(()) => {
                    clip.is_playing = true;
                    started += 1;
                }
                Err(e) => log::error!("failed to start clip {} in {part}: {e}", clip.id),
            }
        }
        started
    }

    pub fn pause_part(&mut self, graph: &mut GraphManager, clips: &mut [AudioClip], part: SongPart) {
        for clip in clips.iter_mut().filter(|clip| clip.song_part == part) {
            clip.is_playing = false;
            if let (Some(handle), Some(context)) = (self.handles.get(&clip.id), graph.context_mut()) {
                let _ = context.pause(handle.element);
            }
        }
    }

    /// Clamp to `[0, 1]`, store on the clip and apply to the live route.
    /// Clears a mute.
    pub fn set_volume(
        &mut self,
        graph: &mut GraphManager,
        clips: &mut [AudioClip],
        id: &ClipId,
        value: f32,
    ) -> f32 {
        let volume = clamp_volume(value);
        if let Some(clip) = find(clips, id) {
            clip.volume = volume;
        }
        if let Some(handle) = self.handles.get_mut(id) {
            handle.muted = false;
            if let Some(context) = graph.context_mut() {
                apply_level(context, handle, volume, self.smoothing);
            }
        }
        volume
    }

    /// Flip between silence and the stored volume without changing it.
    /// Returns whether the clip is now muted.
    pub fn toggle_mute(&mut self, graph: &mut GraphManager, clips: &[AudioClip], id: &ClipId) -> bool {
        let Some(handle) = self.handles.get_mut(id) else {
            return false;
        };
        handle.muted = !handle.muted;
        let stored = clips
            .iter()
            .find(|clip| clip.id == *id)
            .map_or(1.0, |clip| clamp_volume(clip.volume));
        let level = if handle.muted { 0.0 } else { stored };
        if let Some(context) = graph.context_mut() {
            apply_level(context, handle, level, self.smoothing);
        }
        handle.muted
    }

    /// Nudge a clip's tempo by `delta_bpm`. The stored bpm is clamped to
    /// `[60, 200]`; the live rate is the ratio to the tempo the handle was
    /// created with, clamped to `[0.5, 1.5]`. A non-finite delta changes
    /// nothing. Returns the new bpm.
    pub fn adjust_tempo(
        &mut self,
        graph: &mut GraphManager,
        clips: &mut [AudioClip],
        id: &ClipId,
        delta_bpm: f64,
    ) -> Option<f64> {
        let clip = find(clips, id)?;
        let current = if clip.bpm.is_finite() { clip.bpm } else { DEFAULT_BPM };
        let delta = if delta_bpm.is_finite() { delta_bpm } else { 0.0 };
        let target = (current + delta).clamp(MIN_BPM, MAX_BPM);
        clip.bpm = target;

        if let Some(handle) = self.handles.get_mut(id) {
            handle.rate = tempo_ratio(target, handle.base_bpm);
            apply_rate(graph, id, handle);
        }
        Some(target)
    }

    /// Shift a clip's pitch to `semitones`, clamped to an octave either way.
    /// Pitch and speed move together; the shift multiplies whatever rate the
    /// tempo has set. Returns the applied shift.
    pub fn transpose(
        &mut self,
        graph: &mut GraphManager,
        clips: &mut [AudioClip],
        id: &ClipId,
        semitones: i32,
    ) -> Option<i32> {
        let clip = find(clips, id)?;
        let semitones = semitones.clamp(-MAX_TRANSPOSE, MAX_TRANSPOSE);
        clip.transpose = semitones;

        if let Some(handle) = self.handles.get_mut(id) {
            handle.transpose = semitones;
            apply_rate(graph, id, handle);
        }
        log::debug!("clip {id} transposed by {semitones}");
        Some(semitones)
    }

    /// Returns the new loop flag.
    pub fn toggle_loop(&mut self, graph: &mut GraphManager, clips: &mut [AudioClip], id: &ClipId) -> bool {
        let Some(clip) = find(clips, id) else {
            return false;
        };
        clip.is_looping = !clip.is_looping;
        if let (Some(handle), Some(context)) = (self.handles.get(id), graph.context_mut()) {
            let _ = context.set_loop(handle.element, clip.is_looping);
        }
        clip.is_looping
    }

    /// Move the playhead, clamped to the clip.
    pub fn seek(&mut self, graph: &mut GraphManager, clips: &[AudioClip], id: &ClipId, seconds: f64) {
        let (Some(handle), Some(context)) = (self.handles.get(id), graph.context_mut()) else {
            return;
        };
        let duration = clips
            .iter()
            .find(|clip| clip.id == *id)
            .map(|clip| clip.duration)
            .filter(|duration| *duration > 0.0)
            .or_else(|| context.source_duration(handle.element))
            .unwrap_or(0.0);
        let target = if seconds.is_finite() {
            seconds.clamp(0.0, duration)
        } else {
            0.0
        };
        let _ = context.seek(handle.element, target);
    }

    /// Rebuild the clip's effects chain from its stored configuration.
    pub fn apply_effects(&mut self, graph: &mut GraphManager, clips: &[AudioClip], id: &ClipId) -> bool {
        let Some(clip) = clips.iter().find(|clip| clip.id == *id) else {
            return false;
        };
        let Some(handle) = self.handles.get_mut(id) else {
            // applied when the handle is built
            return true;
        };
        let Some(gain) = handle.gain else {
            log::warn!("clip {id} is not routed through the graph, effects unavailable");
            return false;
        };
        let Some(context) = graph.context_mut() else {
            return false;
        };
        let config = clip.effects.unwrap_or_default();
        handle
            .chain
            .rebuild(context, handle.element, gain, &config)
            .is_ok()
    }

    /// Play position in seconds.
    pub fn current_time(&self, graph: &GraphManager, id: &ClipId) -> Option<f64> {
        let handle = self.handles.get(id)?;
        graph.context()?.position(handle.element)
    }

    /// Play position as a fraction of the clip, 0 when unknown.
    pub fn progress(&self, graph: &GraphManager, id: &ClipId) -> f64 {
        let Some(handle) = self.handles.get(id) else {
            return 0.0;
        };
        let Some(context) = graph.context() else {
            return 0.0;
        };
        match (context.position(handle.element), context.source_duration(handle.element)) {
            (Some(position), Some(duration)) if duration > 0.0 => (position / duration).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }

    /// Play one chop of a clip once, through its own gain.
    pub fn play_chop(
        &mut self,
        graph: &mut GraphManager,
        cache: &mut BufferCache,
        clip: &AudioClip,
        chop: &AudioChop,
        volume: f32,
    ) -> bool {
        let context = match graph.ensure_context() {
            Ok(context) => context,
            Err(e) => {
                log::error!("cannot play chop {}: {e}", chop.name);
                return false;
            }
        };
        let buffer = match cache.load(&clip.audio_url, context.sample_rate()) {
            Ok(buffer) => buffer.slice_secs(chop.start_time, chop.end_time),
            Err(e) => {
                log::error!("failed to load clip {} for chop: {e:#}", clip.id);
                return false;
            }
        };

        let voice = build_voice(context, buffer, clamp_volume(volume));
        match voice {
            Ok(voice) => {
                self.voices.push(voice);
                true
            }
            Err(e) => {
                log::error!("failed to play chop {}: {e}", chop.name);
                false
            }
        }
    }

    /// Fold ended sources into clip state and release finished chop voices.
    /// Returns the clips whose playback just ended.
    pub fn handle_ended(
        &mut self,
        graph: &mut GraphManager,
        clips: &mut [AudioClip],
        ended: &[NodeId],
    ) -> Vec<ClipId> {
        let mut finished = Vec::new();
        for (id, handle) in &self.handles {
            if ended.contains(&handle.element) {
                if let Some(clip) = find(clips, id) {
                    clip.is_playing = false;
                }
                finished.push(id.clone());
            }
        }

        if let Some(context) = graph.context_mut() {
            self.voices.retain(|voice| {
                if ended.contains(&voice.source) {
                    let _ = context.remove(voice.source);
                    let _ = context.remove(voice.gain);
                    false
                } else {
                    true
                }
            });
        }
        finished.sort();
        finished
    }

    /// Drop a clip's handle and every node it owns.
    pub fn remove_clip(&mut self, graph: &mut GraphManager, id: &ClipId) {
        let Some(mut handle) = self.handles.remove(id) else {
            return;
        };
        if let Some(context) = graph.context_mut() {
            handle.chain.teardown(context);
            let _ = context.remove(handle.element);
        }
        graph.release_track_gain(id);
        log::debug!("released playback handle for clip {id}");
    }

    pub fn dispose(&mut self, graph: &mut GraphManager) {
        let ids: Vec<_> = self.handles.keys().cloned().collect();
        for id in ids {
            self.remove_clip(graph, &id);
        }
        if let Some(context) = graph.context_mut() {
            for voice in self.voices.drain(..) {
                let _ = context.remove(voice.source);
                let _ = context.remove(voice.gain);
            }
        }
        self.voices.clear();
    }
}

fn apply_rate(graph: &mut GraphManager, id: &ClipId, handle: &PlaybackHandle) {
    if let Some(context) = graph.context_mut()
        && let Err(e) = context.set_playback_rate(handle.element, handle.effective_rate() as f32)
    {
        log::warn!("failed to set rate for clip {id}: {e}");
    }
}

fn rewind(context: &mut AudioContext, element: NodeId) {
    let _ = context.pause(element);
    let _ = context.seek(element, 0.0);
}

/// `element -> [effects] -> gain -> destination`.
fn route_through_gain(
    graph: &mut GraphManager,
    chain: &mut EffectsChain,
    clip: &AudioClip,
    element: NodeId,
    volume: f32,
) -> Result<NodeId, GraphError> {
    let gain = graph.track_gain(&clip.id, volume)?;
    let context = graph.ensure_context()?;
    let wired = match &clip.effects {
        Some(effects) if effects.any_enabled() => {
            // a chain that fails to build leaves the clip routed dry
            let _ = chain.rebuild(context, element, gain, effects);
            Ok(())
        }
        _ => context.connect(element, gain),
    };
    if let Err(e) = wired {
        let _ = context.disconnect(element);
        graph.release_track_gain(&clip.id);
        return Err(e);
    }
    Ok(gain)
}

/// `element -> destination`, with the clip's volume on the element.
fn route_direct(graph: &mut GraphManager, element: NodeId, volume: f32) -> bool {
    let Some(context) = graph.context_mut() else {
        return false;
    };
    let destination = context.destination();
    let routed = context
        .disconnect(element)
        .and_then(|()| context.connect(element, destination))
        .and_then(|()| context.set_element_volume(element, volume));
    match routed {
        Ok(()) => true,
        Err(e) => {
            log::error!("direct routing failed: {e}");
            false
        }
    }
}

/// Ramp the clip's gain, or set the element volume when unrouted.
fn apply_level(context: &mut AudioContext, handle: &PlaybackHandle, level: f32, smoothing: f32) {
    let now = context.current_time();
    let result = match handle.gain {
        Some(gain) => context.set_param_target(gain, ParamKind::Gain, level, now, smoothing),
        None => context.set_element_volume(handle.element, level),
    };
    if let Err(e) = result {
        log::warn!("failed to apply level: {e}");
    }
}

fn build_voice(
    context: &mut AudioContext,
    buffer: AudioArc,
    volume: f32,
) -> Result<ChopVoice, GraphError> {
    let source = context.create(NodeSpec::BufferSource { buffer })?;
    let gain = match context.create(NodeSpec::Gain { gain: volume }) {
        Ok(gain) => gain,
        Err(e) => {
            let _ = context.remove(source);
            return Err(e);
        }
    };
    let destination = context.destination();
    let now = context.current_time();
    let wired = context
        .connect(source, gain)
        .and_then(|()| context.connect(gain, destination))
        .and_then(|()| context.start(source, now));
    if let Err(e) = wired {
        let _ = context.remove(source);
        let _ = context.remove(gain);
        return Err(e);
    }
    Ok(ChopVoice { source, gain })
}

impl Default for ClipPlayer {
    fn default() -> Self {
        Self::new(0.01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beatlayer_engine::{ContextState, NodeKind};
    use beatlayer_transport::LayerKey;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    const RATE: u32 = 8000;

    fn write_wav(path: &Path, seconds: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..(RATE as f32 * seconds) as usize {
            writer.write_sample(8000i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    struct Rig {
        _dir: TempDir,
        graph: GraphManager,
        cache: BufferCache,
        player: ClipPlayer,
        clips: Vec<AudioClip>,
    }

    fn rig_with_limit(max_nodes: usize) -> Rig {
        let dir = tempdir().unwrap();
        let mut clips = Vec::new();
        for (name, part, seconds) in [
            ("a", SongPart::Intro, 0.5),
            ("b", SongPart::Intro, 0.25),
            ("c", SongPart::Hook, 0.5),
        ] {
            let path = dir.path().join(format!("{name}.wav"));
            write_wav(&path, seconds);
            let mut clip = AudioClip::new(
                name,
                part,
                LayerKey::Beats,
                path.display().to_string(),
                seconds as f64,
            );
            clip.volume = 0.8;
            clips.push(clip);
        }
        Rig {
            _dir: dir,
            graph: GraphManager::offline(RATE, max_nodes),
            cache: BufferCache::new(Duration::from_secs(1)),
            player: ClipPlayer::new(0.01),
            clips,
        }
    }

    fn rig() -> Rig {
        rig_with_limit(64)
    }

    impl Rig {
        fn play(&mut self, id: &str, looping: bool) -> bool {
            self.player.play(
                &mut self.graph,
                &mut self.cache,
                &mut self.clips,
                &ClipId::from(id),
                looping,
            )
        }

        fn clip(&self, id: &str) -> &AudioClip {
            self.clips.iter().find(|c| c.id.as_str() == id).unwrap()
        }

        fn ctx(&self) -> &AudioContext {
            self.graph.context().unwrap()
        }

        fn handle(&self, id: &str) -> &PlaybackHandle {
            self.player.handle(&ClipId::from(id)).unwrap()
        }
    }

    #[test]
    fn test_play_builds_routed_handle_once() {
        let mut rig = rig();
        assert!(rig.play("a", true));
        assert!(rig.clip("a").is_playing);
        assert!(rig.clip("a").is_looping);

        let handle = rig.handle("a");
        let (element, gain) = (handle.element(), handle.gain().unwrap());
        assert_eq!(rig.ctx().state(), ContextState::Running);
        assert_eq!(rig.ctx().node_kind(element), Some(NodeKind::MediaElement));
        assert_eq!(rig.ctx().outputs(element), vec![gain]);
        assert_eq!(rig.ctx().outputs(gain), vec![rig.ctx().destination()]);
        assert_eq!(rig.ctx().param_value(gain, ParamKind::Gain), Some(0.8));

        rig.player
            .pause(&mut rig.graph, &mut rig.clips, &ClipId::from("a"));
        assert!(!rig.clip("a").is_playing);
        assert!(rig.play("a", false));
        assert_eq!(rig.player.handle_count(), 1);
        assert_eq!(rig.handle("a").element(), element);
        assert_eq!(rig.ctx().node_count(), 2);
    }

    #[test]
    fn test_set_volume_clamps_store_and_live_gain() {
        let mut rig = rig();
        rig.play("a", false);
        let gain = rig.handle("a").gain().unwrap();
        for (input, expected) in [(1.7, 1.0), (-0.3, 0.0), (0.42, 0.42)] {
            let applied =
                rig.player
                    .set_volume(&mut rig.graph, &mut rig.clips, &ClipId::from("a"), input);
            assert_eq!(applied, expected);
            assert_eq!(rig.clip("a").volume, expected);
            assert_eq!(rig.ctx().param_value(gain, ParamKind::Gain), Some(expected));
        }
    }

    #[test]
    fn test_adjust_tempo_uses_fixed_base() {
        let mut rig = rig();
        rig.play("a", false);
        let id = ClipId::from("a");

        let bpm = rig
            .player
            .adjust_tempo(&mut rig.graph, &mut rig.clips, &id, 10.0)
            .unwrap();
        assert_eq!(bpm, 130.0);
        let rate = rig.handle("a").playback_rate();
        assert!((rate - 130.0 / 120.0).abs() < 1.0e-9);
        let live = rig.ctx().playback_rate(rig.handle("a").element()).unwrap();
        assert!((live as f64 - 1.0833).abs() < 1.0e-3);

        rig.player
            .adjust_tempo(&mut rig.graph, &mut rig.clips, &id, 500.0);
        assert_eq!(rig.clip("a").bpm, 200.0);
        assert_eq!(rig.handle("a").playback_rate(), 1.5);
        assert_eq!(rig.handle("a").base_bpm(), 120.0);

        rig.player
            .adjust_tempo(&mut rig.graph, &mut rig.clips, &id, -500.0);
        assert_eq!(rig.clip("a").bpm, 60.0);
        assert_eq!(rig.handle("a").playback_rate(), 0.5);
    }

    #[test]
    fn test_non_finite_tempo_delta_is_ignored() {
        let mut rig = rig();
        rig.play("a", false);
        let id = ClipId::from("a");
        rig.player
            .adjust_tempo(&mut rig.graph, &mut rig.clips, &id, 10.0);

        for delta in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let bpm = rig
                .player
                .adjust_tempo(&mut rig.graph, &mut rig.clips, &id, delta)
                .unwrap();
            assert_eq!(bpm, 130.0);
            assert_eq!(rig.clip("a").bpm, 130.0);
            let rate = rig.handle("a").playback_rate();
            assert!((0.5..=1.5).contains(&rate));
            let live = rig.ctx().playback_rate(rig.handle("a").element()).unwrap();
            assert!(live.is_finite());
        }

        // later nudges still work from the kept tempo
        let bpm = rig
            .player
            .adjust_tempo(&mut rig.graph, &mut rig.clips, &id, -10.0)
            .unwrap();
        assert_eq!(bpm, 120.0);
        assert_eq!(rig.handle("a").playback_rate(), 1.0);
    }

    #[test]
    fn test_transpose_multiplies_tempo_rate() {
        let mut rig = rig();
        rig.play("a", false);
        let id = ClipId::from("a");

        let applied = rig
            .player
            .transpose(&mut rig.graph, &mut rig.clips, &id, 12)
            .unwrap();
        assert_eq!(applied, 12);
        assert_eq!(rig.clip("a").transpose, 12);
        let element = rig.handle("a").element();
        assert!((rig.ctx().playback_rate(element).unwrap() - 2.0).abs() < 1.0e-6);

        rig.player
            .adjust_tempo(&mut rig.graph, &mut rig.clips, &id, -30.0);
        // tempo part stays in range, the shift scales it
        assert_eq!(rig.handle("a").playback_rate(), 0.75);
        assert!((rig.handle("a").effective_rate() - 1.5).abs() < 1.0e-9);
        assert!((rig.ctx().playback_rate(element).unwrap() - 1.5).abs() < 1.0e-6);

        assert_eq!(
            rig.player
                .transpose(&mut rig.graph, &mut rig.clips, &id, -40),
            Some(-12)
        );
        assert!((rig.ctx().playback_rate(element).unwrap() - 0.375).abs() < 1.0e-6);

        rig.player
            .transpose(&mut rig.graph, &mut rig.clips, &id, 0);
        assert!((rig.ctx().playback_rate(element).unwrap() - 0.75).abs() < 1.0e-6);
    }

    #[test]
    fn test_transpose_before_first_play_is_applied_on_play() {
        let mut rig = rig();
        let id = ClipId::from("b");
        assert_eq!(
            rig.player
                .transpose(&mut rig.graph, &mut rig.clips, &id, -12),
            Some(-12)
        );
        assert!(rig.player.handle(&id).is_none());

        rig.play("b", false);
        assert_eq!(rig.handle("b").transpose(), -12);
        let element = rig.handle("b").element();
        assert!((rig.ctx().playback_rate(element).unwrap() - 0.5).abs() < 1.0e-6);
        assert!(
            rig.player
                .transpose(&mut rig.graph, &mut rig.clips, &ClipId::from("missing"), 3)
                .is_none()
        );
    }

    #[test]
    fn test_play_exclusive_rewinds_others() {
        let mut rig = rig();
        rig.play("a", false);
        rig.graph.context_mut().unwrap().render(800);
        let a = rig.handle("a").element();
        assert!(rig.ctx().position(a).unwrap() > 0.0);

        assert!(rig.player.play_exclusive(
            &mut rig.graph,
            &mut rig.cache,
            &mut rig.clips,
            &ClipId::from("c"),
            false
        ));
        assert!(!rig.clip("a").is_playing);
        assert!(rig.clip("c").is_playing);
        assert!(!rig.ctx().is_playing(a));
        assert_eq!(rig.ctx().position(a), Some(0.0));
    }

    #[test]
    fn test_play_independent_leaves_others_running() {
        let mut rig = rig();
        rig.play("a", false);
        assert!(rig.player.play_independent(
            &mut rig.graph,
            &mut rig.cache,
            &mut rig.clips,
            &ClipId::from("c"),
            false
        ));
        assert!(rig.clip("a").is_playing && rig.clip("c").is_playing);
        assert!(rig.ctx().is_playing(rig.handle("a").element()));
    }

    #[test]
    fn test_fallback_routes_element_directly() {
        // room for the element but not its gain
        let mut rig = rig_with_limit(1);
        assert!(rig.play("a", false));
        let handle = rig.handle("a");
        assert!(!handle.is_routed());
        let element = handle.element();
        assert_eq!(rig.ctx().outputs(element), vec![rig.ctx().destination()]);
        assert_eq!(rig.ctx().element_volume(element), Some(0.8));

        rig.player
            .set_volume(&mut rig.graph, &mut rig.clips, &ClipId::from("a"), 0.3);
        assert_eq!(rig.ctx().element_volume(element), Some(0.3));
        assert_eq!(rig.clip("a").volume, 0.3);

        let out = rig.graph.context_mut().unwrap().render(128);
        assert!(out.iter().any(|s| s.abs() > 0.0));
    }

    #[test]
    fn test_unloadable_clip_leaves_state_untouched() {
        let mut rig = rig();
        rig.clips[0].audio_url = "/nonexistent/missing.wav".into();
        assert!(!rig.play("a", true));
        assert!(!rig.clip("a").is_playing);
        assert!(!rig.clip("a").is_looping);
        assert!(rig.player.handle(&ClipId::from("a")).is_none());
        assert!(!rig.play("zzz", false));
    }

    #[test]
    fn test_toggle_mute_keeps_stored_volume() {
        let mut rig = rig();
        rig.play("a", false);
        let id = ClipId::from("a");
        let gain = rig.handle("a").gain().unwrap();

        assert!(rig.player.toggle_mute(&mut rig.graph, &rig.clips, &id));
        assert_eq!(rig.ctx().param_value(gain, ParamKind::Gain), Some(0.0));
        assert_eq!(rig.clip("a").volume, 0.8);

        assert!(!rig.player.toggle_mute(&mut rig.graph, &rig.clips, &id));
        assert_eq!(rig.ctx().param_value(gain, ParamKind::Gain), Some(0.8));
    }

    #[test]
    fn test_toggle_loop_updates_clip_and_element() {
        let mut rig = rig();
        rig.play("a", false);
        let id = ClipId::from("a");
        assert!(rig.player.toggle_loop(&mut rig.graph, &mut rig.clips, &id));
        assert!(rig.clip("a").is_looping);
        assert!(rig.ctx().is_looping(rig.handle("a").element()));
    }

    #[test]
    fn test_seek_clamps_to_duration() {
        let mut rig = rig();
        rig.play("a", false);
        let id = ClipId::from("a");
        rig.player.seek(&mut rig.graph, &rig.clips, &id, 9.0);
        assert_eq!(rig.player.current_time(&rig.graph, &id), Some(0.5));
        rig.player.seek(&mut rig.graph, &rig.clips, &id, 0.125);
        assert_eq!(rig.player.current_time(&rig.graph, &id), Some(0.125));
        assert!((rig.player.progress(&rig.graph, &id) - 0.25).abs() < 1.0e-9);
    }

    #[test]
    fn test_ended_clip_is_reported_and_cleared() {
        let mut rig = rig();
        rig.play("b", false);
        // 0.25 s at 8 kHz
        rig.graph.context_mut().unwrap().render(4000);
        let ended = rig.graph.context_mut().unwrap().take_ended();
        let finished = rig
            .player
            .handle_ended(&mut rig.graph, &mut rig.clips, &ended);
        assert_eq!(finished, vec![ClipId::from("b")]);
        assert!(!rig.clip("b").is_playing);
    }

    #[test]
    fn test_apply_effects_rebuilds_chain() {
        let mut rig = rig();
        rig.play("a", false);
        let id = ClipId::from("a");
        let mut effects = beatlayer_transport::EffectsConfig::default();
        effects.filter.enabled = true;
        rig.clips[0].effects = Some(effects);

        assert!(rig.player.apply_effects(&mut rig.graph, &rig.clips, &id));
        let handle = rig.handle("a");
        let filter = handle.chain().entries()[0];
        assert_eq!(rig.ctx().node_kind(filter), Some(NodeKind::Biquad));
        assert_eq!(rig.ctx().outputs(handle.element()), vec![filter]);
        assert_eq!(rig.ctx().outputs(filter), vec![handle.gain().unwrap()]);
    }

    #[test]
    fn test_play_part_switches_parts() {
        let mut rig = rig();
        rig.play("c", true);
        let started = rig.player.play_part(
            &mut rig.graph,
            &mut rig.cache,
            &mut rig.clips,
            SongPart::Intro,
        );
        assert_eq!(started, 2);
        assert!(rig.clip("a").is_playing && rig.clip("b").is_playing);
        assert!(!rig.clip("c").is_playing);
        assert!(!rig.ctx().is_playing(rig.handle("c").element()));
        assert!(!rig.ctx().is_looping(rig.handle("a").element()));

        rig.player
            .pause_part(&mut rig.graph, &mut rig.clips, SongPart::Intro);
        assert!(!rig.clip("a").is_playing);
        assert!(!rig.ctx().is_playing(rig.handle("b").element()));
    }

    #[test]
    fn test_chop_voice_is_released_after_it_ends() {
        let mut rig = rig();
        let clip = rig.clips[0].clone();
        let chop = AudioChop {
            id: "chop-0".into(),
            start_time: 0.0,
            end_time: 0.1,
            name: "Chop 1".into(),
        };
        assert!(rig
            .player
            .play_chop(&mut rig.graph, &mut rig.cache, &clip, &chop, 0.5));
        assert_eq!(rig.ctx().node_count(), 2);

        rig.graph.context_mut().unwrap().render(1600);
        let ended = rig.graph.context_mut().unwrap().take_ended();
        rig.player.handle_ended(&mut rig.graph, &mut rig.clips, &ended);
        assert_eq!(rig.ctx().node_count(), 0);
    }

    #[test]
    fn test_remove_clip_releases_nodes() {
        let mut rig = rig();
        rig.play("a", false);
        rig.play("c", false);
        rig.player.remove_clip(&mut rig.graph, &ClipId::from("a"));
        assert!(rig.player.handle(&ClipId::from("a")).is_none());
        assert_eq!(rig.ctx().node_count(), 2);
        rig.player.dispose(&mut rig.graph);
        assert_eq!(rig.ctx().node_count(), 0);
    }
}
