//! Multi-layer mixer.
//!
//! Four fixed layers (beats, bass, melody, vocals) play one-shot buffer
//! sources that all start on the same frame. Each layer feeds its own gain,
//! all layer gains feed a master gain, and the master feeds the destination.
//!
//! Layers are fetched and decoded on background threads; finished loads are
//! picked up by [`Mixer::poll`] on the control thread.

use std::thread;
use std::time::{Duration, Instant};

use beatlayer_engine::{AudioContext, GraphError, NodeId, NodeSpec, ParamKind};
use beatlayer_transport::{AudioArc, LayerGroup, LayerKey, clamp_unit, clamp_volume};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::cache::{BufferCache, load_resampled};
use crate::config::EngineConfig;
use crate::graph_manager::GraphManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Empty,
    Loading,
    Ready,
}

#[derive(Debug)]
struct Layer {
    state: LayerState,
    url: Option<String>,
    buffer: Option<AudioArc>,
    volume: f32,
    gain: Option<NodeId>,
    source: Option<NodeId>,
    /// Context time the current source was scheduled for.
    started_at: Option<f64>,
    /// Bumped on every assignment so stale loads are ignored.
    generation: u64,
}

impl Layer {
    fn new(volume: f32) -> Self {
        Self {
            state: LayerState::Empty,
            url: None,
            buffer: None,
            volume,
            gain: None,
            source: None,
            started_at: None,
            generation: 0,
        }
    }
}

struct LoadResult {
    key: LayerKey,
    generation: u64,
    url: String,
    result: anyhow::Result<AudioArc>,
}

pub struct Mixer {
    layers: [Layer; 4],
    master: Option<NodeId>,
    master_volume: f32,
    crossfade: Option<f32>,
    lookahead: f64,
    smoothing: f32,
    /// At least one layer has been assigned since the last reset.
    assigned: bool,
    results_tx: Sender<LoadResult>,
    results_rx: Receiver<LoadResult>,
}

impl Mixer {
    pub fn new(default_volume: f32, lookahead_secs: f64, smoothing_time_constant: f32) -> Self {
        let volume = clamp_volume(default_volume);
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        Self {
            layers: LayerKey::ALL.map(|_| Layer::new(volume)),
            master: None,
            master_volume: 1.0,
            crossfade: None,
            lookahead: lookahead_secs.max(0.0),
            smoothing: smoothing_time_constant,
            assigned: false,
            results_tx,
            results_rx,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.default_layer_volume,
            config.lookahead_secs,
            config.smoothing_time_constant,
        )
    }

    fn layer(&self, key: LayerKey) -> &Layer {
        &self.layers[key.index()]
    }

    fn layer_mut(&mut self, key: LayerKey) -> &mut Layer {
        &mut self.layers[key.index()]
    }

    pub fn layer_state(&self, key: LayerKey) -> LayerState {
        self.layer(key).state
    }

    pub fn layer_url(&self, key: LayerKey) -> Option<&str> {
        self.layer(key).url.as_deref()
    }

    /// Stored volume of a layer, before crossfade.
    pub fn layer_volume(&self, key: LayerKey) -> f32 {
        self.layer(key).volume
    }

    pub fn volumes(&self) -> [(LayerKey, f32); 4] {
        LayerKey::ALL.map(|key| (key, self.layer(key).volume))
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume
    }

    pub fn crossfade(&self) -> Option<f32> {
        self.crossfade
    }

    pub fn layer_gain(&self, key: LayerKey) -> Option<NodeId> {
        self.layer(key).gain
    }

    pub fn master_gain(&self) -> Option<NodeId> {
        self.master
    }

    pub fn layer_source(&self, key: LayerKey) -> Option<NodeId> {
        self.layer(key).source
    }

    /// Context time the layer's current source was scheduled to start at.
    pub fn scheduled_start(&self, key: LayerKey) -> Option<f64> {
        self.layer(key).started_at
    }

    /// True once every assigned layer has finished loading, successfully or
    /// not.
    pub fn is_ready(&self) -> bool {
        self.assigned
            && self
                .layers
                .iter()
                .all(|layer| layer.state != LayerState::Loading)
    }

    /// True while any scheduled layer source has not yet played out.
    pub fn is_playing(&self) -> bool {
        self.layers.iter().any(|layer| layer.source.is_some())
    }

    /// Level a layer's gain is driven to: the stored volume, scaled by the
    /// crossfader when one is set.
    pub fn effective_level(&self, key: LayerKey) -> f32 {
        let volume = self.layer(key).volume;
        match (self.crossfade, key.group()) {
            (None, _) => volume,
            (Some(t), LayerGroup::A) => volume * (1.0 - t),
            (Some(t), LayerGroup::B) => volume * t,
        }
    }

    /// Live gain value of a layer as last set on the context.
    pub fn gain_level(&self, graph: &GraphManager, key: LayerKey) -> Option<f32> {
        let gain = self.layer(key).gain?;
        graph.context()?.param_value(gain, ParamKind::Gain)
    }

    /// Assign a URL to a layer and start fetching it in the background.
    pub fn load_layer(
        &mut self,
        graph: &mut GraphManager,
        cache: &BufferCache,
        key: LayerKey,
        url: &str,
    ) {
        let sample_rate = match graph.ensure_context() {
            Ok(context) => context.sample_rate(),
            Err(e) => {
                log::error!("cannot load layer {key}: {e}");
                return;
            }
        };
        self.assigned = true;

        let layer = self.layer_mut(key);
        layer.generation += 1;
        layer.url = Some(url.to_string());
        let generation = layer.generation;

        if let Some(buffer) = cache.get(url, sample_rate) {
            layer.buffer = Some(buffer);
            layer.state = LayerState::Ready;
            log::debug!("layer {key} ready from cache");
            return;
        }
        layer.buffer = None;
        layer.state = LayerState::Loading;

        let tx = self.results_tx.clone();
        let owned_url = url.to_string();
        let timeout = cache.timeout();
        let spawned = thread::Builder::new()
            .name(format!("layer-loader-{key}"))
            .spawn(move || {
                let result = load_resampled(&owned_url, timeout, sample_rate);
                let _ = tx.send(LoadResult {
                    key,
                    generation,
                    url: owned_url,
                    result,
                });
            });
        if let Err(e) = spawned {
            log::error!("failed to spawn loader for layer {key}: {e}");
            let layer = self.layer_mut(key);
            layer.state = LayerState::Empty;
            layer.url = None;
        } else {
            log::debug!("layer {key} loading from {url}");
        }
    }

    /// Pick up finished loads. Returns how many layers changed state.
    pub fn poll(&mut self, cache: &mut BufferCache) -> usize {
        let mut changed = 0;
        loop {
            match self.results_rx.try_recv() {
                Ok(result) => {
                    if self.apply_load(cache, result) {
                        changed += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        changed
    }

    /// Block until every assigned layer has resolved or `timeout` passes.
    pub fn wait_until_ready(&mut self, cache: &mut BufferCache, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.poll(cache);
        while self
            .layers
            .iter()
            .any(|layer| layer.state == LayerState::Loading)
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.results_rx.recv_timeout(remaining) {
                Ok(result) => {
                    self.apply_load(cache, result);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.is_ready()
    }

    fn apply_load(&mut self, cache: &mut BufferCache, load: LoadResult) -> bool {
        let key = load.key;
        let layer = self.layer_mut(key);
        if layer.generation != load.generation || layer.state != LayerState::Loading {
            log::debug!("discarding stale load for layer {key}");
            return false;
        }
        match load.result {
            Ok(buffer) => {
                log::info!(
                    "layer {key} ready ({:.2}s)",
                    buffer.duration_secs()
                );
                layer.buffer = Some(buffer.clone());
                layer.state = LayerState::Ready;
                cache.insert(&load.url, buffer);
            }
            Err(e) => {
                log::warn!("layer {key} failed to load from {}: {e:#}", load.url);
                layer.buffer = None;
                layer.url = None;
                layer.state = LayerState::Empty;
            }
        }
        true
    }

    /// Return a layer to `Empty`, stopping its source.
    pub fn clear_layer(&mut self, graph: &mut GraphManager, key: LayerKey) {
        let layer = self.layer_mut(key);
        layer.generation += 1;
        layer.state = LayerState::Empty;
        layer.url = None;
        layer.buffer = None;
        layer.started_at = None;
        if let Some(source) = layer.source.take()
            && let Some(context) = graph.context_mut()
        {
            release_source(context, source);
        }
    }

    /// Master gain and one gain per layer, created on first use.
    fn ensure_nodes(&mut self, context: &mut AudioContext) -> Result<(), GraphError> {
        let master = match self.master.filter(|id| context.contains(*id)) {
            Some(master) => master,
            None => {
                let master = context.create(NodeSpec::Gain {
                    gain: self.master_volume,
                })?;
                let destination = context.destination();
                context.connect(master, destination)?;
                self.master = Some(master);
                master
            }
        };

        for key in LayerKey::ALL {
            if self.layer(key).gain.is_some_and(|id| context.contains(id)) {
                continue;
            }
            let level = self.effective_level(key);
            let gain = context.create(NodeSpec::Gain { gain: level })?;
            context.connect(gain, master)?;
            self.layer_mut(key).gain = Some(gain);
        }
        Ok(())
    }

    /// Restart every ready layer from the top, all on one shared frame
    /// `lookahead` seconds from now. Returns how many layers were started.
    pub fn play(&mut self, graph: &mut GraphManager) -> usize {
        self.stop(graph);
        let context = match graph.ensure_context() {
            Ok(context) => context,
            Err(e) => {
                log::error!("cannot start mixer: {e}");
                return 0;
            }
        };
        if let Err(e) = self.ensure_nodes(context) {
            log::error!("cannot build mixer gains: {e}");
            return 0;
        }

        let when = context.current_time() + self.lookahead;
        let mut started = 0;
        context.begin_batch();
        for key in LayerKey::ALL {
            let layer = &self.layers[key.index()];
            let (Some(buffer), Some(gain)) = (layer.buffer.clone(), layer.gain) else {
                continue;
            };
            match schedule_source(context, buffer, gain, when) {
                Ok(source) => {
                    let layer = &mut self.layers[key.index()];
                    layer.source = Some(source);
                    layer.started_at = Some(when);
                    started += 1;
                }
                Err(e) => log::warn!("skipping layer {key}: {e}"),
            }
        }
        context.commit_batch();
        log::info!("mixer started {started} layers at {when:.3}s");
        started
    }

    /// Stop and discard every layer source.
    pub fn stop(&mut self, graph: &mut GraphManager) {
        let mut context = graph.context_mut();
        for layer in &mut self.layers {
            layer.started_at = None;
            if let Some(source) = layer.source.take()
                && let Some(context) = context.as_deref_mut()
            {
                release_source(context, source);
            }
        }
    }

    /// Drop sources that have played out.
    pub fn handle_ended(&mut self, graph: &mut GraphManager, ended: &[NodeId]) {
        let mut context = graph.context_mut();
        for layer in &mut self.layers {
            let Some(source) = layer.source else {
                continue;
            };
            if ended.contains(&source) {
                layer.source = None;
                if let Some(context) = context.as_deref_mut() {
                    let _ = context.remove(source);
                }
            }
        }
    }

    /// Clamp, store and ramp a layer's level. Playback is not restarted.
    pub fn set_layer_volume(&mut self, graph: &mut GraphManager, key: LayerKey, value: f32) -> f32 {
        let volume = clamp_volume(value);
        self.layer_mut(key).volume = volume;
        let level = self.effective_level(key);
        self.ramp(graph, self.layer(key).gain, level);
        volume
    }

    pub fn set_master_volume(&mut self, graph: &mut GraphManager, value: f32) -> f32 {
        let volume = clamp_volume(value);
        self.master_volume = volume;
        self.ramp(graph, self.master, volume);
        volume
    }

    /// Blend between group A (beats, bass) at 0 and group B (melody, vocals)
    /// at 1.
    pub fn set_crossfade(&mut self, graph: &mut GraphManager, position: f32) -> f32 {
        let t = clamp_unit(position);
        self.crossfade = Some(t);
        self.apply_levels(graph);
        t
    }

    /// Forget the crossfader so every layer plays at its stored volume.
    pub fn clear_crossfade(&mut self, graph: &mut GraphManager) {
        self.crossfade = None;
        self.apply_levels(graph);
    }

    /// Silence every layer except `key`, which plays at its stored volume.
    /// Nothing is remembered; the next volume or crossfade change overrides
    /// it.
    pub fn toggle_solo(&mut self, graph: &mut GraphManager, key: LayerKey) {
        for other in LayerKey::ALL {
            let level = if other == key {
                self.layer(other).volume
            } else {
                0.0
            };
            self.ramp(graph, self.layer(other).gain, level);
        }
    }

    fn apply_levels(&mut self, graph: &mut GraphManager) {
        for key in LayerKey::ALL {
            let level = self.effective_level(key);
            self.ramp(graph, self.layer(key).gain, level);
        }
    }

    fn ramp(&self, graph: &mut GraphManager, gain: Option<NodeId>, level: f32) {
        let (Some(gain), Some(context)) = (gain, graph.context_mut()) else {
            return;
        };
        let now = context.current_time();
        if let Err(e) = context.set_param_target(gain, ParamKind::Gain, level, now, self.smoothing)
        {
            log::warn!("failed to ramp gain {gain}: {e}");
        }
    }

    /// Stop playback and release every node the mixer owns.
    pub fn dispose(&mut self, graph: &mut GraphManager) {
        self.stop(graph);
        if let Some(context) = graph.context_mut() {
            for layer in &mut self.layers {
                if let Some(gain) = layer.gain.take() {
                    let _ = context.remove(gain);
                }
            }
            if let Some(master) = self.master.take() {
                let _ = context.remove(master);
            }
        }
        self.layers.iter_mut().for_each(|layer| layer.gain = None);
        self.master = None;
    }
}

fn schedule_source(
    context: &mut AudioContext,
    buffer: AudioArc,
    gain: NodeId,
    when: f64,
) -> Result<NodeId, GraphError> {
    let source = context.create(NodeSpec::BufferSource { buffer })?;
    let wired = context
        .connect(source, gain)
        .and_then(|()| context.start(source, when));
    if let Err(e) = wired {
        let _ = context.remove(source);
        return Err(e);
    }
    Ok(source)
}

fn release_source(context: &mut AudioContext, source: NodeId) {
    let _ = context.stop(source);
    let _ = context.remove(source);
}
