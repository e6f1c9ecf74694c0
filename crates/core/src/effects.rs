//! Per-clip effects chain.
//!
//! A configuration is first flattened into an ordered list of stages by
//! [`plan`], then [`EffectsChain::rebuild`] splices those stages between a
//! clip's source and its output gain. Node creation goes through
//! [`NodeFactory`] so the wiring can be checked without an audio backend.

use std::sync::Arc;

use beatlayer_engine::{AudioContext, GraphError, NodeId, NodeSpec, Oversample};
use beatlayer_transport::{AudioArc, EffectsConfig, FilterType};
use rand::Rng;

/// Reverb tail length.
pub const IMPULSE_SECONDS: f64 = 2.0;
pub const FILTER_Q: f32 = 1.0;
/// Level of the delayed path mixed back with the dry signal.
pub const DELAY_WET_GAIN: f32 = 0.3;
pub const MAX_DELAY_SECS: f32 = 1.0;
pub const COMPRESSOR_KNEE: f32 = 30.0;
pub const COMPRESSOR_ATTACK: f32 = 0.003;
pub const COMPRESSOR_RELEASE: f32 = 0.25;
pub const DISTORTION_CURVE_POINTS: usize = 44100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EffectStage {
    Reverb { amount: f32 },
    Filter { kind: FilterType, frequency: f32 },
    Distortion { amount: f32 },
    Delay { time_secs: f32, feedback: f32 },
    Compressor { threshold: f32, ratio: f32 },
}

impl EffectStage {
    pub fn name(&self) -> &'static str {
        match self {
            EffectStage::Reverb { .. } => "reverb",
            EffectStage::Filter { .. } => "filter",
            EffectStage::Distortion { .. } => "distortion",
            EffectStage::Delay { .. } => "delay",
            EffectStage::Compressor { .. } => "compressor",
        }
    }
}

/// Enabled effects in chain order: reverb, filter, distortion, delay,
/// compressor. Disabled slots are left out entirely.
pub fn plan(config: &EffectsConfig) -> Vec<EffectStage> {
    let config = config.clamped();
    let mut stages = Vec::with_capacity(5);
    if config.reverb.enabled {
        stages.push(EffectStage::Reverb {
            amount: config.reverb.amount,
        });
    }
    if config.filter.enabled {
        stages.push(EffectStage::Filter {
            kind: config.filter.kind,
            frequency: config.filter.frequency,
        });
    }
    if config.distortion.enabled {
        stages.push(EffectStage::Distortion {
            amount: config.distortion.amount,
        });
    }
    if config.delay.enabled {
        stages.push(EffectStage::Delay {
            time_secs: config.delay.time_secs() as f32,
            feedback: config.delay.feedback,
        });
    }
    if config.compression.enabled {
        stages.push(EffectStage::Compressor {
            threshold: config.compression.threshold,
            ratio: config.compression.ratio,
        });
    }
    stages
}

/// Stereo white noise under a decaying envelope.
pub fn impulse_response(sample_rate: u32, seconds: f64) -> AudioArc {
    let length = (sample_rate as f64 * seconds) as usize;
    let mut rng = rand::rng();
    let mut samples = Vec::with_capacity(length * 2);
    for i in 0..length {
        let envelope = (1.0 - i as f32 / length as f32).powi(2);
        for _ in 0..2 {
            samples.push(rng.random_range(-1.0f32..1.0) * envelope);
        }
    }
    AudioArc::new(samples, sample_rate, 2)
}

/// Saturating transfer curve; `amount` in 0-1 pushes it harder.
pub fn distortion_curve(amount: f32) -> Arc<[f32]> {
    let points = DISTORTION_CURVE_POINTS;
    (0..points)
        .map(|i| {
            let x = (i as f32 * 2.0) / points as f32 - 1.0;
            ((3.0 + amount) * x * 20.0) / (1.0 + x.abs() * 20.0)
        })
        .collect()
}

/// The graph operations the chain builder needs.
pub trait NodeFactory {
    fn sample_rate(&self) -> u32;
    fn destination_node(&self) -> NodeId;
    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError>;
    fn connect_nodes(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError>;
    /// Drop every outgoing connection of `node`.
    fn disconnect_all(&mut self, node: NodeId) -> Result<(), GraphError>;
    fn remove_node(&mut self, node: NodeId) -> Result<(), GraphError>;

    /// Group the following changes so they take effect together.
    fn begin_changes(&mut self) {}
    fn commit_changes(&mut self) {}
}

impl NodeFactory for AudioContext {
    fn sample_rate(&self) -> u32 {
        AudioContext::sample_rate(self)
    }

    fn destination_node(&self) -> NodeId {
        self.destination()
    }

    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        self.create(spec)
    }

    fn connect_nodes(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.connect(from, to)
    }

    fn disconnect_all(&mut self, node: NodeId) -> Result<(), GraphError> {
        self.disconnect(node)
    }

    fn remove_node(&mut self, node: NodeId) -> Result<(), GraphError> {
        self.remove(node)
    }

    fn begin_changes(&mut self) {
        self.begin_batch();
    }

    fn commit_changes(&mut self) {
        self.commit_batch();
    }
}

/// Entry and exit of a built stage.
struct StageNodes {
    input: NodeId,
    output: NodeId,
}

impl StageNodes {
    fn single(id: NodeId) -> Self {
        Self {
            input: id,
            output: id,
        }
    }
}

fn build_stage<F: NodeFactory + ?Sized>(
    factory: &mut F,
    stage: &EffectStage,
    owned: &mut Vec<NodeId>,
) -> Result<StageNodes, GraphError> {
    // nodes are recorded as they are created; a half-built stage is
    // released along with the rest of the chain
    let mut create = |factory: &mut F, spec: NodeSpec| -> Result<NodeId, GraphError> {
        let id = factory.create_node(spec)?;
        owned.push(id);
        Ok(id)
    };

    match *stage {
        EffectStage::Reverb { amount } => {
            let impulse = impulse_response(factory.sample_rate(), IMPULSE_SECONDS);
            let convolver = create(factory, NodeSpec::Convolver { impulse })?;
            let wet = create(factory, NodeSpec::Gain { gain: amount })?;
            factory.connect_nodes(convolver, wet)?;
            Ok(StageNodes {
                input: convolver,
                output: wet,
            })
        }
        EffectStage::Filter { kind, frequency } => {
            let filter = create(
                factory,
                NodeSpec::Biquad {
                    kind,
                    frequency,
                    q: FILTER_Q,
                },
            )?;
            Ok(StageNodes::single(filter))
        }
        EffectStage::Distortion { amount } => {
            let shaper = create(
                factory,
                NodeSpec::WaveShaper {
                    curve: distortion_curve(amount),
                    oversample: Oversample::X4,
                },
            )?;
            Ok(StageNodes::single(shaper))
        }
        EffectStage::Delay {
            time_secs,
            feedback,
        } => {
            let split = create(factory, NodeSpec::Gain { gain: 1.0 })?;
            let delay = create(
                factory,
                NodeSpec::Delay {
                    max_delay_secs: MAX_DELAY_SECS,
                    delay_time: time_secs,
                    feedback,
                },
            )?;
            let wet = create(
                factory,
                NodeSpec::Gain {
                    gain: DELAY_WET_GAIN,
                },
            )?;
            let merge = create(factory, NodeSpec::Gain { gain: 1.0 })?;
            factory.connect_nodes(split, merge)?;
            factory.connect_nodes(split, delay)?;
            factory.connect_nodes(delay, wet)?;
            factory.connect_nodes(wet, merge)?;
            Ok(StageNodes {
                input: split,
                output: merge,
            })
        }
        EffectStage::Compressor { threshold, ratio } => {
            let compressor = create(
                factory,
                NodeSpec::Compressor {
                    threshold,
                    knee: COMPRESSOR_KNEE,
                    ratio,
                    attack: COMPRESSOR_ATTACK,
                    release: COMPRESSOR_RELEASE,
                },
            )?;
            Ok(StageNodes::single(compressor))
        }
    }
}

/// The live chain of one clip. Holds only node ids; the nodes live in the
/// context.
#[derive(Debug, Default, Clone)]
pub struct EffectsChain {
    stages: Vec<EffectStage>,
    nodes: Vec<NodeId>,
    /// First node of each stage, in order.
    entries: Vec<NodeId>,
}

impl EffectsChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[EffectStage] {
        &self.stages
    }

    /// Every node the chain currently owns.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Entry node of each stage, in signal order.
    pub fn entries(&self) -> &[NodeId] {
        &self.entries
    }

    /// Rewire `source -> stages -> output -> destination` for `config`.
    ///
    /// All changes are grouped so the render side switches chains between two
    /// blocks. If any step fails the clip is routed dry instead, so it is never
    /// left silent or connected twice.
    pub fn rebuild<F: NodeFactory + ?Sized>(
        &mut self,
        factory: &mut F,
        source: NodeId,
        output: NodeId,
        config: &EffectsConfig,
    ) -> Result<(), GraphError> {
        let stages = plan(config);
        factory.begin_changes();
        let result = self.rewire(factory, source, output, &stages);
        if let Err(e) = &result {
            log::warn!("effects chain rebuild failed, routing dry: {e}");
            self.route_dry(factory, source, output);
        } else {
            log::debug!(
                "effects chain rebuilt: [{}]",
                stages.iter().map(EffectStage::name).collect::<Vec<_>>().join(" -> ")
            );
            self.stages = stages;
        }
        factory.commit_changes();
        result
    }

    fn rewire<F: NodeFactory + ?Sized>(
        &mut self,
        factory: &mut F,
        source: NodeId,
        output: NodeId,
        stages: &[EffectStage],
    ) -> Result<(), GraphError> {
        factory.disconnect_all(source)?;
        factory.disconnect_all(output)?;
        self.release_nodes(factory);

        let mut previous = source;
        for stage in stages {
            let built = build_stage(factory, stage, &mut self.nodes)?;
            factory.connect_nodes(previous, built.input)?;
            self.entries.push(built.input);
            previous = built.output;
        }

        let destination = factory.destination_node();
        factory.connect_nodes(previous, output)?;
        factory.connect_nodes(output, destination)?;
        Ok(())
    }

    fn route_dry<F: NodeFactory + ?Sized>(&mut self, factory: &mut F, source: NodeId, output: NodeId) {
        let _ = factory.disconnect_all(source);
        let _ = factory.disconnect_all(output);
        self.release_nodes(factory);
        self.stages.clear();
        let destination = factory.destination_node();
        if let Err(e) = factory
            .connect_nodes(source, output)
            .and_then(|()| factory.connect_nodes(output, destination))
        {
            log::error!("dry routing failed: {e}");
        }
    }

    fn release_nodes<F: NodeFactory + ?Sized>(&mut self, factory: &mut F) {
        for id in self.nodes.drain(..) {
            let _ = factory.remove_node(id);
        }
        self.entries.clear();
    }

    /// Remove every chain node. The source and output are left alone.
    pub fn teardown<F: NodeFactory + ?Sized>(&mut self, factory: &mut F) {
        self.release_nodes(factory);
        self.stages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beatlayer_engine::NodeKind;
    use std::collections::HashMap;

    /// Records what the builder asks for.
    #[derive(Default)]
    pub(crate) struct MockFactory {
        next: u32,
        pub kinds: HashMap<NodeId, NodeKind>,
        pub edges: Vec<(NodeId, NodeId)>,
        pub fail_on: Option<NodeKind>,
        pub batches: usize,
    }

    impl MockFactory {
        pub(crate) fn new() -> Self {
            Self {
                next: 1,
                ..Self::default()
            }
        }

        pub(crate) fn add(&mut self, kind: NodeKind) -> NodeId {
            let id = NodeId::new(self.next);
            self.next += 1;
            self.kinds.insert(id, kind);
            id
        }

        /// Kinds along the path from `start`, following the first edge out
        /// of each node, up to the destination.
        pub(crate) fn path_from(&self, start: NodeId) -> Vec<NodeKind> {
            let mut path = Vec::new();
            let mut current = start;
            while let Some((_, to)) = self.edges.iter().find(|(from, _)| *from == current) {
                current = *to;
                if current == NodeId::DESTINATION {
                    path.push(NodeKind::Destination);
                    break;
                }
                path.push(self.kinds[&current]);
            }
            path
        }

        pub(crate) fn count(&self, kind: NodeKind) -> usize {
            self.kinds.values().filter(|k| **k == kind).count()
        }
    }

    impl NodeFactory for MockFactory {
        fn sample_rate(&self) -> u32 {
            8000
        }

        fn destination_node(&self) -> NodeId {
            NodeId::DESTINATION
        }

        fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
            if self.fail_on == Some(spec.kind()) {
                return Err(GraphError::NodeLimit { limit: 0 });
            }
            Ok(self.add(spec.kind()))
        }

        fn connect_nodes(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
            if !self.edges.contains(&(from, to)) {
                self.edges.push((from, to));
            }
            Ok(())
        }

        fn disconnect_all(&mut self, node: NodeId) -> Result<(), GraphError> {
            self.edges.retain(|(from, _)| *from != node);
            Ok(())
        }

        fn remove_node(&mut self, node: NodeId) -> Result<(), GraphError> {
            self.kinds.remove(&node);
            self.edges.retain(|(from, to)| *from != node && *to != node);
            Ok(())
        }

        fn commit_changes(&mut self) {
            self.batches += 1;
        }
    }

    fn all_enabled() -> EffectsConfig {
        let mut config = EffectsConfig::default();
        config.reverb.enabled = true;
        config.filter.enabled = true;
        config.distortion.enabled = true;
        config.delay.enabled = true;
        config.compression.enabled = true;
        config
    }

    #[test]
    fn test_plan_follows_canonical_order() {
        let stages = plan(&all_enabled());
        let names: Vec<_> = stages.iter().map(EffectStage::name).collect();
        assert_eq!(
            names,
            ["reverb", "filter", "distortion", "delay", "compressor"]
        );
    }

    #[test]
    fn test_plan_skips_disabled_without_reordering() {
        let mut config = all_enabled();
        config.filter.enabled = false;
        config.delay.enabled = false;
        let names: Vec<_> = plan(&config).iter().map(EffectStage::name).collect();
        assert_eq!(names, ["reverb", "distortion", "compressor"]);
        assert!(plan(&EffectsConfig::default()).is_empty());
    }

    #[test]
    fn test_plan_clamps_and_converts_units() {
        let mut config = EffectsConfig::default();
        config.delay.enabled = true;
        config.delay.time = 5000.0;
        config.delay.feedback = 0.4;
        assert_eq!(
            plan(&config),
            vec![EffectStage::Delay {
                time_secs: 1.0,
                feedback: 0.4
            }]
        );
    }

    #[test]
    fn test_rebuild_wires_stages_in_order() {
        let mut factory = MockFactory::new();
        let source = factory.add(NodeKind::MediaElement);
        let output = factory.add(NodeKind::Gain);
        let mut chain = EffectsChain::new();

        let mut config = EffectsConfig::default();
        config.filter.enabled = true;
        config.compression.enabled = true;
        chain.rebuild(&mut factory, source, output, &config).unwrap();

        assert_eq!(
            factory.path_from(source),
            vec![
                NodeKind::Biquad,
                NodeKind::Compressor,
                NodeKind::Gain,
                NodeKind::Destination
            ]
        );
        assert_eq!(chain.entries().len(), 2);
        assert_eq!(factory.batches, 1);
    }

    #[test]
    fn test_rebuild_twice_is_idempotent() {
        let mut factory = MockFactory::new();
        let source = factory.add(NodeKind::MediaElement);
        let output = factory.add(NodeKind::Gain);
        let mut chain = EffectsChain::new();

        let mut config = EffectsConfig::default();
        config.reverb.enabled = false;
        config.filter.enabled = true;
        config.filter.frequency = 1000.0;

        chain.rebuild(&mut factory, source, output, &config).unwrap();
        let first_edges = factory.edges.len();
        chain.rebuild(&mut factory, source, output, &config).unwrap();

        assert_eq!(factory.count(NodeKind::Biquad), 1);
        assert_eq!(factory.count(NodeKind::Convolver), 0);
        assert_eq!(factory.edges.len(), first_edges);
        assert_eq!(
            factory.path_from(source),
            vec![NodeKind::Biquad, NodeKind::Gain, NodeKind::Destination]
        );
    }

    #[test]
    fn test_delay_stage_mixes_dry_and_wet() {
        let mut factory = MockFactory::new();
        let source = factory.add(NodeKind::MediaElement);
        let output = factory.add(NodeKind::Gain);
        let mut chain = EffectsChain::new();

        let mut config = EffectsConfig::default();
        config.delay.enabled = true;
        chain.rebuild(&mut factory, source, output, &config).unwrap();

        assert_eq!(chain.nodes().len(), 4);
        assert_eq!(factory.count(NodeKind::Delay), 1);
        // split fans out to merge and delay; merge sums dry and wet
        let split = chain.entries()[0];
        assert_eq!(factory.edges.iter().filter(|(from, _)| *from == split).count(), 2);
        let (merge, _) = *factory.edges.iter().find(|(_, to)| *to == output).unwrap();
        assert_eq!(factory.edges.iter().filter(|(_, to)| *to == merge).count(), 2);
    }

    #[test]
    fn test_failed_rebuild_routes_dry() {
        let mut factory = MockFactory::new();
        let source = factory.add(NodeKind::MediaElement);
        let output = factory.add(NodeKind::Gain);
        let mut chain = EffectsChain::new();

        let mut config = EffectsConfig::default();
        config.filter.enabled = true;
        config.compression.enabled = true;
        factory.fail_on = Some(NodeKind::Compressor);

        assert!(chain.rebuild(&mut factory, source, output, &config).is_err());
        assert!(chain.nodes().is_empty());
        assert!(chain.stages().is_empty());
        assert_eq!(factory.count(NodeKind::Biquad), 0);
        assert_eq!(
            factory.path_from(source),
            vec![NodeKind::Gain, NodeKind::Destination]
        );
    }

    #[test]
    fn test_disabling_everything_leaves_dry_path() {
        let mut factory = MockFactory::new();
        let source = factory.add(NodeKind::MediaElement);
        let output = factory.add(NodeKind::Gain);
        let mut chain = EffectsChain::new();

        chain.rebuild(&mut factory, source, output, &all_enabled()).unwrap();
        chain
            .rebuild(&mut factory, source, output, &EffectsConfig::default())
            .unwrap();
        assert!(chain.nodes().is_empty());
        assert_eq!(factory.kinds.len(), 2);
        assert_eq!(
            factory.path_from(source),
            vec![NodeKind::Gain, NodeKind::Destination]
        );
    }

    #[test]
    fn test_impulse_decays_to_silence() {
        let impulse = impulse_response(1000, 2.0);
        assert_eq!(impulse.channels(), 2);
        assert_eq!(impulse.frames(), 2000);
        let head: f32 = impulse.samples()[..200].iter().map(|s| s.abs()).sum();
        let tail: f32 = impulse.samples()[3800..].iter().map(|s| s.abs()).sum();
        assert!(tail < head);
        assert!(impulse.samples().iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_distortion_curve_is_odd_and_saturating() {
        let curve = distortion_curve(0.5);
        assert_eq!(curve.len(), DISTORTION_CURVE_POINTS);
        let mid = DISTORTION_CURVE_POINTS / 2;
        assert!(curve[mid].abs() < 1.0e-3);
        assert!(curve[0] < 0.0 && curve[DISTORTION_CURVE_POINTS - 1] > 0.0);
        // steep near zero, flat near the ends
        let near_zero = curve[mid + 10] - curve[mid];
        let near_end = curve[DISTORTION_CURVE_POINTS - 1] - curve[DISTORTION_CURVE_POINTS - 11];
        assert!(near_zero > near_end * 10.0);
    }
}
