use std::time::Duration;

use beatlayer_transport::{AudioChop, AudioClip, ClipId, LayerKey, SongPart};

use crate::cache::BufferCache;
use crate::clip_player::ClipPlayer;
use crate::config::EngineConfig;
use crate::graph_manager::GraphManager;
use crate::mixer::Mixer;
use crate::sequencer::{PartSequencer, SequencerEvent};

/// One user session: the shared context and everything that plays through
/// it. Clip metadata stays with the caller and is passed in by reference.
pub struct Session {
    config: EngineConfig,
    graph: GraphManager,
    cache: BufferCache,
    player: ClipPlayer,
    mixer: Mixer,
    sequencer: PartSequencer,
    last_event: Option<SequencerEvent>,
}

impl Session {
    /// Real-time session on the default output device. The context itself
    /// is created on first use.
    pub fn new(config: EngineConfig) -> Self {
        let graph = GraphManager::from_config(&config);
        Self::with_graph(config, graph)
    }

    /// Session rendering into an in-process offline context.
    pub fn offline(config: EngineConfig, sample_rate: u32) -> Self {
        let graph = GraphManager::offline(sample_rate, config.max_nodes);
        Self::with_graph(config, graph)
    }

    fn with_graph(config: EngineConfig, graph: GraphManager) -> Self {
        Self {
            cache: BufferCache::new(config.fetch_timeout()),
            player: ClipPlayer::new(config.smoothing_time_constant),
            mixer: Mixer::from_config(&config),
            sequencer: PartSequencer::new(),
            last_event: None,
            graph,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &GraphManager {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut GraphManager {
        &mut self.graph
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    pub fn player(&self) -> &ClipPlayer {
        &self.player
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    pub fn sequencer(&self) -> &PartSequencer {
        &self.sequencer
    }

    /// Most recent advance or finish reported by the sequencer.
    pub fn last_sequencer_event(&self) -> Option<SequencerEvent> {
        self.last_event
    }

    pub fn current_time(&self) -> f64 {
        self.graph.current_time()
    }

    // clips

    pub fn play_clip(&mut self, clips: &mut [AudioClip], id: &ClipId, looping: bool) -> bool {
        self.player
            .play(&mut self.graph, &mut self.cache, clips, id, looping)
    }

    pub fn play_exclusive(&mut self, clips: &mut [AudioClip], id: &ClipId, looping: bool) -> bool {
        self.player
            .play_exclusive(&mut self.graph, &mut self.cache, clips, id, looping)
    }

    pub fn play_independent(&mut self, clips: &mut [AudioClip], id: &ClipId, looping: bool) -> bool {
        self.player
            .play_independent(&mut self.graph, &mut self.cache, clips, id, looping)
    }

    pub fn pause_clip(&mut self, clips: &mut [AudioClip], id: &ClipId) {
        self.player.pause(&mut self.graph, clips, id);
    }

    pub fn set_clip_volume(&mut self, clips: &mut [AudioClip], id: &ClipId, value: f32) -> f32 {
        self.player.set_volume(&mut self.graph, clips, id, value)
    }

    pub fn toggle_mute(&mut self, clips: &[AudioClip], id: &ClipId) -> bool {
        self.player.toggle_mute(&mut self.graph, clips, id)
    }

    pub fn adjust_tempo(&mut self, clips: &mut [AudioClip], id: &ClipId, delta_bpm: f64) -> Option<f64> {
        self.player.adjust_tempo(&mut self.graph, clips, id, delta_bpm)
    }

    pub fn transpose(&mut self, clips: &mut [AudioClip], id: &ClipId, semitones: i32) -> Option<i32> {
        self.player.transpose(&mut self.graph, clips, id, semitones)
    }

    pub fn toggle_loop(&mut self, clips: &mut [AudioClip], id: &ClipId) -> bool {
        self.player.toggle_loop(&mut self.graph, clips, id)
    }

    pub fn seek(&mut self, clips: &[AudioClip], id: &ClipId, seconds: f64) {
        self.player.seek(&mut self.graph, clips, id, seconds);
    }

    pub fn apply_effects(&mut self, clips: &[AudioClip], id: &ClipId) -> bool {
        self.player.apply_effects(&mut self.graph, clips, id)
    }

    pub fn clip_time(&self, id: &ClipId) -> Option<f64> {
        self.player.current_time(&self.graph, id)
    }

    pub fn clip_progress(&self, id: &ClipId) -> f64 {
        self.player.progress(&self.graph, id)
    }

    pub fn play_chop(&mut self, clip: &AudioClip, chop: &AudioChop, volume: f32) -> bool {
        self.player
            .play_chop(&mut self.graph, &mut self.cache, clip, chop, volume)
    }

    /// Decode `url` into the cache at the context rate and report its length
    /// in seconds.
    pub fn probe_duration(&mut self, url: &str) -> anyhow::Result<f64> {
        let sample_rate = self.graph.ensure_context()?.sample_rate();
        Ok(self.cache.load(url, sample_rate)?.duration_secs())
    }

    pub fn remove_clip(&mut self, id: &ClipId) {
        self.player.remove_clip(&mut self.graph, id);
    }

    pub fn play_part(&mut self, clips: &mut [AudioClip], part: SongPart) -> usize {
        self.player
            .play_part(&mut self.graph, &mut self.cache, clips, part)
    }

    pub fn pause_part(&mut self, clips: &mut [AudioClip], part: SongPart) {
        self.player.pause_part(&mut self.graph, clips, part);
    }

    // mixer

    pub fn load_layer(&mut self, key: LayerKey, url: &str) {
        self.mixer.load_layer(&mut self.graph, &self.cache, key, url);
    }

    pub fn wait_for_layers(&mut self, timeout: Duration) -> bool {
        self.mixer.wait_until_ready(&mut self.cache, timeout)
    }

    pub fn clear_layer(&mut self, key: LayerKey) {
        self.mixer.clear_layer(&mut self.graph, key);
    }

    pub fn play_layers(&mut self) -> usize {
        self.mixer.play(&mut self.graph)
    }

    pub fn stop_layers(&mut self) {
        self.mixer.stop(&mut self.graph);
    }

    pub fn set_layer_volume(&mut self, key: LayerKey, value: f32) -> f32 {
        self.mixer.set_layer_volume(&mut self.graph, key, value)
    }

    pub fn set_master_volume(&mut self, value: f32) -> f32 {
        self.mixer.set_master_volume(&mut self.graph, value)
    }

    pub fn set_crossfade(&mut self, position: f32) -> f32 {
        self.mixer.set_crossfade(&mut self.graph, position)
    }

    pub fn toggle_solo(&mut self, key: LayerKey) {
        self.mixer.toggle_solo(&mut self.graph, key);
    }

    // sequencer

    pub fn start_sequence(&mut self, clips: &mut [AudioClip]) -> bool {
        self.last_event = None;
        self.sequencer
            .start(&mut self.graph, &mut self.cache, &mut self.player, clips)
    }

    pub fn stop_sequence(&mut self, clips: &mut [AudioClip]) {
        self.sequencer.stop(&mut self.graph, &mut self.player, clips);
    }

    /// Start the sequence when idle, stop it when playing. Returns whether it
    /// is playing afterwards.
    pub fn toggle_sequence(&mut self, clips: &mut [AudioClip]) -> bool {
        if self.sequencer.is_playing() {
            self.stop_sequence(clips);
            false
        } else {
            self.start_sequence(clips)
        }
    }

    /// Fold engine status, finished layer loads and due sequencer advances
    /// into session state. Returns the clips whose playback ended.
    pub fn poll(&mut self, clips: &mut [AudioClip]) -> Vec<ClipId> {
        self.graph.poll();
        self.mixer.poll(&mut self.cache);

        let ended = self
            .graph
            .context_mut()
            .map(|context| context.take_ended())
            .unwrap_or_default();
        let finished = if ended.is_empty() {
            Vec::new()
        } else {
            self.mixer.handle_ended(&mut self.graph, &ended);
            self.player.handle_ended(&mut self.graph, clips, &ended)
        };

        if let Some(event) =
            self.sequencer
                .poll(&mut self.graph, &mut self.cache, &mut self.player, clips)
        {
            self.last_event = Some(event);
        }
        finished
    }

    /// Tear down every handle, stop the mixer and close the context.
    pub fn dispose(&mut self) {
        self.sequencer.reset();
        self.player.dispose(&mut self.graph);
        self.mixer.dispose(&mut self.graph);
        self.graph.close();
        self.cache.clear();
        log::info!("session disposed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self
            .graph
            .context()
            .is_some_and(|context| context.state() != beatlayer_engine::ContextState::Closed)
        {
            self.dispose();
        }
    }
}
