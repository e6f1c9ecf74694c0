use std::collections::HashMap;

use beatlayer_engine::{AudioContext, ContextOptions, ContextState, GraphError, NodeId, NodeSpec};
use beatlayer_transport::ClipId;

use crate::config::EngineConfig;

/// Owner of the session's single processing context and the per-clip gain
/// nodes that feed its destination.
pub struct GraphManager {
    context: Option<AudioContext>,
    options: ContextOptions,
    max_nodes: usize,
    track_gains: HashMap<ClipId, NodeId>,
}

impl GraphManager {
    pub fn new(options: ContextOptions, max_nodes: usize) -> Self {
        Self {
            context: None,
            options,
            max_nodes,
            track_gains: HashMap::new(),
        }
    }

    /// Real-time output on the default device.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            ContextOptions::Device {
                sample_rate: config.sample_rate,
            },
            config.max_nodes,
        )
    }

    pub fn offline(sample_rate: u32, max_nodes: usize) -> Self {
        Self::new(ContextOptions::Offline { sample_rate }, max_nodes)
    }

    /// The shared context, created on first use (or after a close) and
    /// resumed on every call. Resume failures are ignored.
    pub fn ensure_context(&mut self) -> Result<&mut AudioContext, GraphError> {
        let stale = self
            .context
            .as_ref()
            .is_none_or(|ctx| ctx.state() == ContextState::Closed);
        if stale {
            let context = AudioContext::new(self.options, self.max_nodes)?;
            log::info!("audio context ready at {} Hz", context.sample_rate());
            self.track_gains.clear();
            self.context = Some(context);
        }

        let Some(context) = self.context.as_mut() else {
            return Err(GraphError::ContextClosed);
        };
        if let Err(e) = context.resume() {
            log::debug!("context resume failed: {e}");
        }
        Ok(context)
    }

    /// The context if it exists, without creating or resuming it.
    pub fn context(&self) -> Option<&AudioContext> {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> Option<&mut AudioContext> {
        self.context.as_mut()
    }

    /// Get or create the gain node that carries a clip to the destination.
    pub fn track_gain(&mut self, clip: &ClipId, volume: f32) -> Result<NodeId, GraphError> {
        if let Some(id) = self.track_gains.get(clip).copied()
            && self.context.as_ref().is_some_and(|ctx| ctx.contains(id))
        {
            return Ok(id);
        }
        let context = self.ensure_context()?;
        let gain = context.create(NodeSpec::Gain { gain: volume })?;
        let destination = context.destination();
        if let Err(e) = context.connect(gain, destination) {
            let _ = context.remove(gain);
            return Err(e);
        }
        self.track_gains.insert(clip.clone(), gain);
        Ok(gain)
    }

    pub fn existing_track_gain(&self, clip: &ClipId) -> Option<NodeId> {
        self.track_gains.get(clip).copied()
    }

    pub fn release_track_gain(&mut self, clip: &ClipId) {
        if let Some(id) = self.track_gains.remove(clip)
            && let Some(context) = self.context.as_mut()
        {
            let _ = context.remove(id);
        }
    }

    /// Current context time, or zero before the context exists.
    pub fn current_time(&self) -> f64 {
        self.context.as_ref().map_or(0.0, AudioContext::current_time)
    }

    pub fn poll(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.poll();
        }
    }

    pub fn close(&mut self) {
        self.track_gains.clear();
        if let Some(context) = self.context.as_mut() {
            context.close();
        }
    }
}
