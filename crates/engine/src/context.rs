//! Control-side half of the processing context.
//!
//! `AudioContext` keeps a mirror of the graph (topology, parameter targets,
//! source transport state) so callers can inspect it without a round trip to
//! the render thread. Mutations are forwarded as [`Command`]s; the render side
//! answers with [`Status`] updates that [`AudioContext::poll`] folds back in.

use std::collections::{HashMap, VecDeque};

use basedrop::{Collector, Handle, Owned};
use rtrb::PushError;

use crate::device::{self, DeviceOutput};
use crate::dsp::build_processor;
use crate::error::GraphError;
use crate::graph::{Command, Graph, Status};
use crate::node::{CHANNELS, NodeId, NodeKind, NodeSpec, ParamKind, SourceCommand};
use crate::param::ParamChange;

pub const DEFAULT_MAX_NODES: usize = 1024;
pub const DEFAULT_OFFLINE_SAMPLE_RATE: u32 = 44100;

const COMMAND_CAPACITY: usize = 1024;
const STATUS_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOptions {
    /// Real-time output on the default device. `None` keeps the device rate.
    Device { sample_rate: Option<u32> },
    /// In-process rendering driven by [`AudioContext::render`].
    Offline { sample_rate: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

enum Backend {
    Device(DeviceOutput),
    Offline(Graph),
}

#[derive(Debug, Clone)]
struct SourceState {
    buffer_rate: u32,
    frames: usize,
    /// Playhead in buffer frames, as last reported.
    position: f64,
    playing: bool,
    looping: bool,
    rate: f32,
    volume: f32,
    ended: bool,
}

#[derive(Debug, Clone)]
struct NodeMirror {
    id: NodeId,
    kind: NodeKind,
    params: Vec<(ParamKind, f32)>,
    inputs: Vec<NodeId>,
    element: Option<String>,
    source: Option<SourceState>,
}

impl NodeMirror {
    fn from_spec(id: NodeId, spec: &NodeSpec) -> Self {
        let source = match spec {
            NodeSpec::BufferSource { buffer } => Some((buffer, 1.0)),
            NodeSpec::MediaElement { buffer, volume, .. } => Some((buffer, *volume)),
            _ => None,
        }
        .map(|(buffer, volume)| SourceState {
            buffer_rate: buffer.sample_rate(),
            frames: buffer.frames(),
            position: 0.0,
            playing: false,
            looping: false,
            rate: 1.0,
            volume: volume.clamp(0.0, 1.0),
            ended: false,
        });

        let element = match spec {
            NodeSpec::MediaElement { element, .. } => Some(element.clone()),
            _ => None,
        };

        Self {
            id,
            kind: spec.kind(),
            params: spec.params(),
            inputs: Vec::new(),
            element,
            source,
        }
    }
}

pub struct AudioContext {
    state: ContextState,
    sample_rate: u32,
    max_nodes: usize,
    backend: Backend,
    commands: rtrb::Producer<Command>,
    status: rtrb::Consumer<Status>,
    /// Commands that did not fit in the ring yet.
    pending: VecDeque<Command>,
    batch: Option<Vec<Command>>,
    nodes: Vec<Option<NodeMirror>>,
    /// Released slots, already carrying the generation their next node gets.
    free: Vec<NodeId>,
    elements: HashMap<String, NodeId>,
    clock: u64,
    ended: Vec<NodeId>,
    handle: Handle,
    collector: Collector,
}

impl AudioContext {
    pub fn new(options: ContextOptions, max_nodes: usize) -> Result<Self, GraphError> {
        let collector = Collector::new();
        let handle = collector.handle();

        let (commands, command_rx) = rtrb::RingBuffer::<Command>::new(COMMAND_CAPACITY);
        let (status_tx, status) = rtrb::RingBuffer::<Status>::new(STATUS_CAPACITY);

        let (backend, sample_rate) = match options {
            ContextOptions::Offline { sample_rate } => {
                let graph = Graph::new(
                    sample_rate as f32,
                    max_nodes,
                    &handle,
                    command_rx,
                    status_tx,
                );
                (Backend::Offline(graph), sample_rate)
            }
            ContextOptions::Device { sample_rate } => {
                let sample_rate = device::default_sample_rate(sample_rate)?;
                let graph = Graph::new(
                    sample_rate as f32,
                    max_nodes,
                    &handle,
                    command_rx,
                    status_tx,
                );
                let output = DeviceOutput::open(graph, sample_rate)?;
                (Backend::Device(output), sample_rate)
            }
        };

        let destination = NodeMirror {
            id: NodeId::DESTINATION,
            kind: NodeKind::Destination,
            params: Vec::new(),
            inputs: Vec::new(),
            element: None,
            source: None,
        };

        log::debug!("audio context created at {sample_rate} Hz, {max_nodes} node limit");

        Ok(Self {
            state: ContextState::Suspended,
            sample_rate,
            max_nodes,
            backend,
            commands,
            status,
            pending: VecDeque::new(),
            batch: None,
            nodes: vec![Some(destination)],
            free: Vec::new(),
            elements: HashMap::new(),
            clock: 0,
            ended: Vec::new(),
            handle,
            collector,
        })
    }

    pub fn offline(sample_rate: u32) -> Result<Self, GraphError> {
        Self::new(ContextOptions::Offline { sample_rate }, DEFAULT_MAX_NODES)
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn destination(&self) -> NodeId {
        NodeId::DESTINATION
    }

    /// Render clock in seconds, as of the last poll.
    pub fn current_time(&self) -> f64 {
        self.clock as f64 / self.sample_rate as f64
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.backend, Backend::Offline(_))
    }

    pub fn resume(&mut self) -> Result<(), GraphError> {
        match self.state {
            ContextState::Closed => Err(GraphError::ContextClosed),
            ContextState::Running => Ok(()),
            ContextState::Suspended => {
                if let Backend::Device(output) = &self.backend {
                    output.play()?;
                }
                self.send(Command::SetRunning(true));
                self.state = ContextState::Running;
                log::debug!("audio context resumed");
                Ok(())
            }
        }
    }

    pub fn suspend(&mut self) -> Result<(), GraphError> {
        match self.state {
            ContextState::Closed => Err(GraphError::ContextClosed),
            ContextState::Suspended => Ok(()),
            ContextState::Running => {
                self.send(Command::SetRunning(false));
                if let Backend::Device(output) = &self.backend {
                    output.pause()?;
                }
                self.state = ContextState::Suspended;
                Ok(())
            }
        }
    }

    /// Stop rendering for good. Nodes stay in the mirror but nothing new can
    /// be created or connected.
    pub fn close(&mut self) {
        if self.state == ContextState::Closed {
            return;
        }
        self.batch = None;
        self.send(Command::SetRunning(false));
        if let Backend::Device(output) = &self.backend
            && let Err(e) = output.pause()
        {
            log::warn!("failed to pause output on close: {e}");
        }
        self.state = ContextState::Closed;
        self.poll();
        log::debug!("audio context closed");
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.state == ContextState::Closed {
            return Err(GraphError::ContextClosed);
        }
        Ok(())
    }

    fn mirror(&self, id: NodeId) -> Result<&NodeMirror, GraphError> {
        self.nodes
            .get(id.index())
            .and_then(Option::as_ref)
            .filter(|node| node.id == id)
            .ok_or(GraphError::UnknownNode(id))
    }

    fn mirror_mut(&mut self, id: NodeId) -> Result<&mut NodeMirror, GraphError> {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|node| node.id == id)
            .ok_or(GraphError::UnknownNode(id))
    }

    fn source_mut(&mut self, id: NodeId) -> Result<&mut SourceState, GraphError> {
        self.mirror_mut(id)?
            .source
            .as_mut()
            .ok_or(GraphError::NotASource(id))
    }

    /// Number of live nodes, not counting the destination.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().skip(1).flatten().count()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.mirror(id).is_ok()
    }

    pub fn create(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        self.ensure_open()?;
        if self.node_count() >= self.max_nodes {
            return Err(GraphError::NodeLimit {
                limit: self.max_nodes,
            });
        }
        if let NodeSpec::MediaElement { element, .. } = &spec
            && self.elements.contains_key(element)
        {
            return Err(GraphError::AlreadyAttached(element.clone()));
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.nodes.push(None);
                NodeId::new((self.nodes.len() - 1) as u32)
            }
        };

        let mirror = NodeMirror::from_spec(id, &spec);
        if let Some(element) = &mirror.element {
            self.elements.insert(element.clone(), id);
        }
        self.nodes[id.index()] = Some(mirror);

        let processor = Owned::new(&self.handle, build_processor(&spec, self.sample_rate as f32));
        self.send(Command::Add { id, processor });
        Ok(id)
    }

    /// True when `target` feeds into `start`, directly or not.
    fn is_upstream(&self, start: NodeId, target: NodeId) -> bool {
        let mut stack = vec![start];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            let index = id.index();
            if index >= seen.len() || seen[index] {
                continue;
            }
            seen[index] = true;
            if let Ok(node) = self.mirror(id) {
                stack.extend(node.inputs.iter().copied());
            }
        }
        false
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.ensure_open()?;
        self.mirror(from)?;
        self.mirror(to)?;
        if from == to || self.is_upstream(from, to) {
            return Err(GraphError::Cycle { from, to });
        }
        let target = self.mirror_mut(to)?;
        if target.inputs.contains(&from) {
            return Ok(());
        }
        target.inputs.push(from);
        self.send(Command::Connect { from, to });
        Ok(())
    }

    /// Drop every outgoing connection of `from`.
    pub fn disconnect(&mut self, from: NodeId) -> Result<(), GraphError> {
        self.mirror(from)?;
        for node in self.nodes.iter_mut().flatten() {
            node.inputs.retain(|input| *input != from);
        }
        self.send(Command::Disconnect { from, to: None });
        Ok(())
    }

    pub fn disconnect_from(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.mirror(from)?;
        self.mirror_mut(to)?.inputs.retain(|input| *input != from);
        self.send(Command::Disconnect { from, to: Some(to) });
        Ok(())
    }

    /// Remove a node and all its edges. A media element's slot is released,
    /// so the same element may be attached again afterwards.
    pub fn remove(&mut self, id: NodeId) -> Result<(), GraphError> {
        if id == NodeId::DESTINATION {
            return Err(GraphError::UnknownNode(id));
        }
        self.mirror(id)?;
        let mirror = self
            .nodes
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(GraphError::UnknownNode(id))?;
        if let Some(element) = mirror.element {
            self.elements.remove(&element);
        }
        for node in self.nodes.iter_mut().flatten() {
            node.inputs.retain(|input| *input != id);
        }
        self.ended.retain(|ended| *ended != id);
        self.free.push(id.next_generation());
        self.send(Command::Remove(id));
        Ok(())
    }

    pub fn node_kind(&self, id: NodeId) -> Option<NodeKind> {
        self.mirror(id).ok().map(|node| node.kind)
    }

    pub fn inputs(&self, id: NodeId) -> &[NodeId] {
        match self.mirror(id) {
            Ok(node) => &node.inputs,
            Err(_) => &[],
        }
    }

    pub fn outputs(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .flatten()
            .filter(|node| node.inputs.contains(&id))
            .map(|node| node.id)
            .collect()
    }

    /// Node currently playing the named media element, if any.
    pub fn element_node(&self, element: &str) -> Option<NodeId> {
        self.elements.get(element).copied()
    }

    fn param_slot(&mut self, id: NodeId, param: ParamKind) -> Result<&mut f32, GraphError> {
        self.mirror_mut(id)?
            .params
            .iter_mut()
            .find(|(kind, _)| *kind == param)
            .map(|(_, value)| value)
            .ok_or(GraphError::UnknownParam { node: id, param })
    }

    pub fn set_param(&mut self, id: NodeId, param: ParamKind, value: f32) -> Result<(), GraphError> {
        *self.param_slot(id, param)? = value;
        self.send(Command::Param {
            id,
            param,
            change: ParamChange::Set(value),
        });
        Ok(())
    }

    /// Exponential approach to `target` starting at `start_time` seconds on
    /// the context clock.
    pub fn set_param_target(
        &mut self,
        id: NodeId,
        param: ParamKind,
        target: f32,
        start_time: f64,
        time_constant: f32,
    ) -> Result<(), GraphError> {
        *self.param_slot(id, param)? = target;
        let start_frame = self.frame_at(start_time);
        self.send(Command::Param {
            id,
            param,
            change: ParamChange::Target {
                target,
                start_frame,
                time_constant,
            },
        });
        Ok(())
    }

    /// Last value or target set on a parameter.
    pub fn param_value(&self, id: NodeId, param: ParamKind) -> Option<f32> {
        self.mirror(id)
            .ok()?
            .params
            .iter()
            .find(|(kind, _)| *kind == param)
            .map(|(_, value)| *value)
    }

    fn frame_at(&self, time: f64) -> u64 {
        (time.max(0.0) * self.sample_rate as f64).round() as u64
    }

    pub fn source_command(&mut self, id: NodeId, command: SourceCommand) -> Result<(), GraphError> {
        let source = self.source_mut(id)?;
        match command {
            SourceCommand::StartAt(_) | SourceCommand::Play => {
                if matches!(command, SourceCommand::Play) && source.position >= source.frames as f64 {
                    source.position = 0.0;
                }
                source.playing = true;
                source.ended = false;
            }
            SourceCommand::Stop | SourceCommand::Pause => source.playing = false,
            SourceCommand::Seek(frame) => {
                source.position = frame.clamp(0.0, source.frames as f64);
                source.ended = false;
            }
            SourceCommand::SetLoop(looping) => source.looping = looping,
            SourceCommand::SetRate(rate) => {
                if rate.is_finite() {
                    source.rate = rate;
                }
            }
            SourceCommand::SetElementVolume(volume) => source.volume = volume.clamp(0.0, 1.0),
        }
        self.send(Command::Source { id, command });
        Ok(())
    }

    /// Schedule a buffer source to begin at `when` seconds on the context
    /// clock. Sources given the same `when` start on the same sample.
    pub fn start(&mut self, id: NodeId, when: f64) -> Result<(), GraphError> {
        let frame = self.frame_at(when);
        self.source_command(id, SourceCommand::StartAt(frame))
    }

    pub fn stop(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.source_command(id, SourceCommand::Stop)
    }

    pub fn play(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.source_command(id, SourceCommand::Play)
    }

    pub fn pause(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.source_command(id, SourceCommand::Pause)
    }

    pub fn seek(&mut self, id: NodeId, seconds: f64) -> Result<(), GraphError> {
        let rate = self.source_mut(id)?.buffer_rate as f64;
        self.source_command(id, SourceCommand::Seek(seconds * rate))
    }

    pub fn set_loop(&mut self, id: NodeId, looping: bool) -> Result<(), GraphError> {
        self.source_command(id, SourceCommand::SetLoop(looping))
    }

    pub fn set_playback_rate(&mut self, id: NodeId, rate: f32) -> Result<(), GraphError> {
        self.source_command(id, SourceCommand::SetRate(rate))
    }

    pub fn set_element_volume(&mut self, id: NodeId, volume: f32) -> Result<(), GraphError> {
        self.source_command(id, SourceCommand::SetElementVolume(volume))
    }

    fn source(&self, id: NodeId) -> Option<&SourceState> {
        self.mirror(id).ok()?.source.as_ref()
    }

    /// Playhead of a source in seconds.
    pub fn position(&self, id: NodeId) -> Option<f64> {
        let source = self.source(id)?;
        Some(source.position / source.buffer_rate.max(1) as f64)
    }

    pub fn source_duration(&self, id: NodeId) -> Option<f64> {
        let source = self.source(id)?;
        Some(source.frames as f64 / source.buffer_rate.max(1) as f64)
    }

    pub fn is_playing(&self, id: NodeId) -> bool {
        self.source(id).is_some_and(|source| source.playing)
    }

    pub fn has_ended(&self, id: NodeId) -> bool {
        self.source(id).is_some_and(|source| source.ended)
    }

    pub fn is_looping(&self, id: NodeId) -> bool {
        self.source(id).is_some_and(|source| source.looping)
    }

    pub fn playback_rate(&self, id: NodeId) -> Option<f32> {
        self.source(id).map(|source| source.rate)
    }

    pub fn element_volume(&self, id: NodeId) -> Option<f32> {
        self.source(id).map(|source| source.volume)
    }

    /// Collect subsequent commands and deliver them as one unit.
    pub fn begin_batch(&mut self) {
        if self.batch.is_none() {
            self.batch = Some(Vec::new());
        }
    }

    pub fn commit_batch(&mut self) {
        let Some(commands) = self.batch.take() else {
            return;
        };
        if commands.is_empty() {
            return;
        }
        let batch = Owned::new(&self.handle, commands);
        self.enqueue(Command::Batch(batch));
    }

    fn send(&mut self, command: Command) {
        match &mut self.batch {
            Some(batch) => batch.push(command),
            None => self.enqueue(command),
        }
    }

    fn enqueue(&mut self, command: Command) {
        self.pending.push_back(command);
        flush(&mut self.pending, &mut self.commands);
    }

    /// Fold render-side status into the mirror and free retired nodes.
    pub fn poll(&mut self) {
        flush(&mut self.pending, &mut self.commands);
        while let Ok(status) = self.status.pop() {
            match status {
                Status::Clock(frame) => self.clock = frame,
                Status::Position { id, frame } => {
                    if let Ok(source) = self.source_mut(id) {
                        source.position = frame;
                    }
                }
                Status::Ended(id) => {
                    if let Ok(source) = self.source_mut(id) {
                        if source.looping {
                            continue;
                        }
                        source.playing = false;
                        source.ended = true;
                        self.ended.push(id);
                    }
                }
            }
        }
        self.collector.collect();
    }

    /// Sources that played out since the last call.
    pub fn take_ended(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.ended)
    }

    /// Advance an offline context by `frames` and return interleaved stereo.
    /// A suspended context renders silence without moving its clock.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let Backend::Offline(graph) = &mut self.backend else {
            log::warn!("render called on a device context");
            return Vec::new();
        };
        loop {
            flush(&mut self.pending, &mut self.commands);
            if self.pending.is_empty() {
                break;
            }
            graph.drain_commands();
        }
        let mut out = vec![0.0f32; frames * CHANNELS];
        graph.fill(&mut out, CHANNELS);
        self.poll();
        out
    }

    /// Render `seconds` worth of audio, discarding it.
    pub fn advance(&mut self, seconds: f64) {
        let frames = self.frame_at(seconds) as usize;
        let _ = self.render(frames);
    }
}

fn flush(pending: &mut VecDeque<Command>, commands: &mut rtrb::Producer<Command>) {
    while let Some(command) = pending.pop_front() {
        if let Err(PushError::Full(command)) = commands.push(command) {
            pending.push_front(command);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beatlayer_transport::AudioArc;

    fn context() -> AudioContext {
        let mut ctx = AudioContext::new(ContextOptions::Offline { sample_rate: 1000 }, 8).unwrap();
        ctx.resume().unwrap();
        ctx
    }

    fn constant(frames: usize, value: f32) -> AudioArc {
        AudioArc::new(vec![value; frames], 1000, 1)
    }

    fn element(name: &str, frames: usize) -> NodeSpec {
        NodeSpec::MediaElement {
            element: name.into(),
            buffer: constant(frames, 0.5),
            volume: 1.0,
        }
    }

    #[test]
    fn test_rejects_cycles() {
        let mut ctx = context();
        let a = ctx.create(NodeSpec::Gain { gain: 1.0 }).unwrap();
        let b = ctx.create(NodeSpec::Gain { gain: 1.0 }).unwrap();
        ctx.connect(a, b).unwrap();
        assert!(matches!(ctx.connect(b, a), Err(GraphError::Cycle { .. })));
        assert!(matches!(ctx.connect(a, a), Err(GraphError::Cycle { .. })));
        // a duplicate edge is a no-op
        ctx.connect(a, b).unwrap();
        assert_eq!(ctx.inputs(b), &[a]);
    }

    #[test]
    fn test_node_limit_and_slot_reuse() {
        let mut ctx = context();
        let ids: Vec<_> = (0..8)
            .map(|_| ctx.create(NodeSpec::Gain { gain: 1.0 }).unwrap())
            .collect();
        assert!(matches!(
            ctx.create(NodeSpec::Gain { gain: 1.0 }),
            Err(GraphError::NodeLimit { limit: 8 })
        ));
        ctx.remove(ids[3]).unwrap();
        let again = ctx.create(NodeSpec::Gain { gain: 1.0 }).unwrap();
        assert_eq!(again.index(), ids[3].index());
        assert_ne!(again, ids[3]);
        assert_eq!(ctx.node_count(), 8);

        // the old id no longer reaches the slot
        assert!(!ctx.contains(ids[3]));
        assert!(matches!(ctx.remove(ids[3]), Err(GraphError::UnknownNode(_))));
        assert!(ctx.contains(again));
    }

    #[test]
    fn test_status_for_removed_node_skips_its_successor() {
        let mut ctx = context();
        let old = ctx.create(NodeSpec::BufferSource { buffer: constant(50, 1.0) }).unwrap();
        ctx.connect(old, ctx.destination()).unwrap();
        ctx.start(old, 0.0).unwrap();

        // render without polling so the end of `old` stays queued
        flush(&mut ctx.pending, &mut ctx.commands);
        let Backend::Offline(graph) = &mut ctx.backend else {
            unreachable!()
        };
        let mut out = vec![0.0f32; 128 * CHANNELS];
        graph.fill(&mut out, CHANNELS);

        ctx.remove(old).unwrap();
        let fresh = ctx.create(NodeSpec::BufferSource { buffer: constant(500, 1.0) }).unwrap();
        assert_eq!(fresh.index(), old.index());
        ctx.poll();

        assert!(!ctx.has_ended(fresh));
        assert_eq!(ctx.position(fresh), Some(0.0));
        assert!(ctx.take_ended().is_empty());

        // the successor still plays and ends under its own id
        ctx.connect(fresh, ctx.destination()).unwrap();
        ctx.start(fresh, ctx.current_time()).unwrap();
        let out = ctx.render(128);
        assert_eq!(out[0], 1.0);
        ctx.render(512);
        assert_eq!(ctx.take_ended(), vec![fresh]);
    }

    #[test]
    fn test_clock_counts_delivered_frames() {
        let mut ctx = context();
        ctx.render(100);
        assert!((ctx.current_time() - 0.1).abs() < 1.0e-9);
        ctx.render(37);
        assert!((ctx.current_time() - 0.137).abs() < 1.0e-9);
        ctx.advance(0.123);
        assert!((ctx.current_time() - 0.26).abs() < 1.0e-9);
    }

    #[test]
    fn test_start_after_partial_quantum_lands_on_time() {
        let mut ctx = context();
        ctx.render(123);
        let src = ctx.create(NodeSpec::BufferSource { buffer: constant(500, 1.0) }).unwrap();
        ctx.connect(src, ctx.destination()).unwrap();
        ctx.start(src, ctx.current_time() + 0.05).unwrap();

        let out = ctx.render(200);
        assert_eq!(out[2 * 49], 0.0);
        assert_eq!(out[2 * 50], 1.0);
    }

    #[test]
    fn test_element_attaches_once_until_removed() {
        let mut ctx = context();
        let first = ctx.create(element("clip-1", 100)).unwrap();
        assert!(matches!(
            ctx.create(element("clip-1", 100)),
            Err(GraphError::AlreadyAttached(_))
        ));
        assert_eq!(ctx.element_node("clip-1"), Some(first));
        ctx.remove(first).unwrap();
        assert!(ctx.create(element("clip-1", 100)).is_ok());
    }

    #[test]
    fn test_closed_context_refuses_nodes() {
        let mut ctx = context();
        ctx.close();
        assert_eq!(ctx.state(), ContextState::Closed);
        assert!(matches!(
            ctx.create(NodeSpec::Gain { gain: 1.0 }),
            Err(GraphError::ContextClosed)
        ));
        assert!(ctx.resume().is_err());
    }

    #[test]
    fn test_render_plays_element_and_reports_end() {
        let mut ctx = context();
        let el = ctx.create(element("clip", 200)).unwrap();
        let gain = ctx.create(NodeSpec::Gain { gain: 0.5 }).unwrap();
        ctx.connect(el, gain).unwrap();
        ctx.connect(gain, ctx.destination()).unwrap();
        ctx.play(el).unwrap();

        let out = ctx.render(128);
        assert!((out[0] - 0.25).abs() < 1.0e-6);
        assert!((ctx.position(el).unwrap() - 0.128).abs() < 1.0e-9);
        assert!((ctx.current_time() - 0.128).abs() < 1.0e-9);

        ctx.render(256);
        assert!(ctx.has_ended(el));
        assert!(!ctx.is_playing(el));
        assert_eq!(ctx.take_ended(), vec![el]);
        assert!(ctx.take_ended().is_empty());
    }

    #[test]
    fn test_sources_started_together_align() {
        let mut ctx = context();
        let a = ctx.create(NodeSpec::BufferSource { buffer: constant(500, 0.25) }).unwrap();
        let b = ctx.create(NodeSpec::BufferSource { buffer: constant(500, 0.5) }).unwrap();
        ctx.connect(a, ctx.destination()).unwrap();
        ctx.connect(b, ctx.destination()).unwrap();
        ctx.start(a, 0.05).unwrap();
        ctx.start(b, 0.05).unwrap();

        let out = ctx.render(128);
        // both silent up to frame 50, then both sounding
        assert_eq!(out[2 * 49], 0.0);
        assert!((out[2 * 50] - 0.75).abs() < 1.0e-6);
    }

    #[test]
    fn test_param_targets_are_mirrored() {
        let mut ctx = context();
        let gain = ctx.create(NodeSpec::Gain { gain: 1.0 }).unwrap();
        ctx.set_param_target(gain, ParamKind::Gain, 0.3, 0.0, 0.01).unwrap();
        assert_eq!(ctx.param_value(gain, ParamKind::Gain), Some(0.3));
        assert!(matches!(
            ctx.set_param(gain, ParamKind::Frequency, 10.0),
            Err(GraphError::UnknownParam { .. })
        ));
    }

    #[test]
    fn test_batch_is_delivered_whole() {
        let mut ctx = context();
        ctx.begin_batch();
        let src = ctx.create(NodeSpec::BufferSource { buffer: constant(500, 1.0) }).unwrap();
        ctx.connect(src, ctx.destination()).unwrap();
        ctx.start(src, 0.0).unwrap();
        ctx.commit_batch();

        let out = ctx.render(4);
        assert_eq!(out[0], 1.0);
    }

    #[test]
    fn test_suspended_offline_context_is_silent() {
        let mut ctx = AudioContext::offline(1000).unwrap();
        let src = ctx.create(NodeSpec::BufferSource { buffer: constant(500, 1.0) }).unwrap();
        ctx.connect(src, ctx.destination()).unwrap();
        ctx.start(src, 0.0).unwrap();
        assert!(ctx.render(128).iter().all(|s| *s == 0.0));
        assert_eq!(ctx.current_time(), 0.0);
    }
}
