//! Render-side half of the processing context.
//!
//! Lives on the audio thread (or in-process for offline rendering). Nothing
//! here allocates in the steady state: slots are preallocated up to the node
//! limit and processors arrive already boxed inside `basedrop::Owned`, so
//! dropping them only queues them for the control side's collector.

use basedrop::{Handle, Owned};

use crate::dsp::gain::Destination;
use crate::node::{
    Block, CHANNELS, NodeId, ParamKind, Processor, RENDER_QUANTUM, RenderInfo, SILENT_BLOCK,
    SourceCommand,
};
use crate::param::ParamChange;

/// Inputs per node before the list has to grow.
const INPUT_CAPACITY: usize = 8;

pub enum Command {
    Add {
        id: NodeId,
        processor: Owned<Box<dyn Processor>>,
    },
    Remove(NodeId),
    Connect {
        from: NodeId,
        to: NodeId,
    },
    /// `to: None` drops every outgoing edge of `from`.
    Disconnect {
        from: NodeId,
        to: Option<NodeId>,
    },
    Param {
        id: NodeId,
        param: ParamKind,
        change: ParamChange,
    },
    Source {
        id: NodeId,
        command: SourceCommand,
    },
    SetRunning(bool),
    /// Applied in one go between two render quanta.
    Batch(Owned<Vec<Command>>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    /// Frames delivered to the output so far.
    Clock(u64),
    /// Source playhead, in frames of its buffer.
    Position { id: NodeId, frame: f64 },
    Ended(NodeId),
}

struct Slot {
    id: NodeId,
    processor: Owned<Box<dyn Processor>>,
    inputs: Vec<NodeId>,
    output: Block,
    last_position: Option<f64>,
    ended_reported: bool,
}

pub struct Graph {
    slots: Vec<Option<Slot>>,
    order: Vec<NodeId>,
    marks: Vec<bool>,
    order_dirty: bool,
    scratch: Block,
    frame: u64,
    sample_rate: f32,
    running: bool,
    /// Read offset into the destination's last block, for device buffers
    /// that are not a multiple of the render quantum.
    cursor: usize,
    commands: rtrb::Consumer<Command>,
    status: rtrb::Producer<Status>,
}

impl Graph {
    pub fn new(
        sample_rate: f32,
        max_nodes: usize,
        handle: &Handle,
        commands: rtrb::Consumer<Command>,
        status: rtrb::Producer<Status>,
    ) -> Self {
        let mut slots: Vec<Option<Slot>> = Vec::with_capacity(max_nodes + 1);
        slots.resize_with(max_nodes + 1, || None);
        let destination: Box<dyn Processor> = Box::new(Destination);
        slots[NodeId::DESTINATION.index()] = Some(Slot::new(
            NodeId::DESTINATION,
            Owned::new(handle, destination),
        ));

        Self {
            slots,
            order: Vec::with_capacity(max_nodes + 1),
            marks: vec![false; max_nodes + 1],
            order_dirty: true,
            scratch: SILENT_BLOCK,
            frame: 0,
            sample_rate,
            running: false,
            cursor: RENDER_QUANTUM,
            commands,
            status,
        }
    }

    /// Frames rendered, in whole quanta.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Frames handed to the output. Trails [`Graph::frame`] by whatever is
    /// left unread in the current quantum.
    pub fn delivered(&self) -> u64 {
        self.frame - (RENDER_QUANTUM - self.cursor.min(RENDER_QUANTUM)) as u64
    }

    /// Apply everything queued by the control side.
    pub fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Add { id, processor } => {
                if let Some(slot) = self.slots.get_mut(id.index()) {
                    *slot = Some(Slot::new(id, processor));
                    self.order_dirty = true;
                }
            }
            Command::Remove(id) => {
                if id == NodeId::DESTINATION {
                    return;
                }
                if self.slot(id).is_none() {
                    return;
                }
                self.slots[id.index()] = None;
                for slot in self.slots.iter_mut().flatten() {
                    slot.inputs.retain(|input| *input != id);
                }
                self.order_dirty = true;
            }
            Command::Connect { from, to } => {
                if self.slot(from).is_none() {
                    return;
                }
                if let Some(slot) = self.slot_mut(to)
                    && !slot.inputs.contains(&from)
                {
                    slot.inputs.push(from);
                    self.order_dirty = true;
                }
            }
            Command::Disconnect { from, to } => {
                match to {
                    Some(to) => {
                        if let Some(slot) = self.slot_mut(to) {
                            slot.inputs.retain(|input| *input != from);
                        }
                    }
                    None => {
                        for slot in self.slots.iter_mut().flatten() {
                            slot.inputs.retain(|input| *input != from);
                        }
                    }
                }
                self.order_dirty = true;
            }
            Command::Param { id, param, change } => {
                if let Some(slot) = self.slot_mut(id)
                    && let Some(param) = slot.processor.param_mut(param)
                {
                    param.apply(change);
                }
            }
            Command::Source { id, command } => {
                if let Some(slot) = self.slot_mut(id) {
                    slot.processor.command(command);
                    if matches!(command, SourceCommand::Play | SourceCommand::Seek(_)) {
                        slot.ended_reported = false;
                    }
                }
            }
            Command::SetRunning(running) => self.running = running,
            Command::Batch(mut batch) => {
                for command in batch.drain(..) {
                    self.apply(command);
                }
            }
        }
    }

    fn slot(&self, id: NodeId) -> Option<&Slot> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .filter(|slot| slot.id == id)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|slot| slot.id == id)
    }

    /// Post-order walk from the destination: every node comes after its
    /// inputs, and nodes that cannot reach the output are left out.
    fn rebuild_order(&mut self) {
        self.order.clear();
        self.marks.fill(false);
        visit(&self.slots, &mut self.marks, &mut self.order, NodeId::DESTINATION);
        self.order_dirty = false;
    }

    /// Render one quantum; the result is left in the destination slot.
    fn render_quantum(&mut self) {
        if self.order_dirty {
            self.rebuild_order();
        }
        let info = RenderInfo {
            frame: self.frame,
            sample_rate: self.sample_rate,
        };

        for k in 0..self.order.len() {
            let id = self.order[k].index();
            self.scratch = SILENT_BLOCK;
            let input_count = self.slots[id].as_ref().map_or(0, |s| s.inputs.len());
            for i in 0..input_count {
                let Some(source) = self.slots[id].as_ref().map(|s| s.inputs[i]) else {
                    continue;
                };
                if let Some(upstream) = self.slots[source.index()]
                    .as_ref()
                    .filter(|upstream| upstream.id == source)
                {
                    for ch in 0..CHANNELS {
                        for (acc, sample) in self.scratch[ch].iter_mut().zip(&upstream.output[ch]) {
                            *acc += *sample;
                        }
                    }
                }
            }
            if let Some(slot) = self.slots[id].as_mut() {
                slot.output = SILENT_BLOCK;
                slot.processor.process(&self.scratch, &mut slot.output, &info);
            }
        }

        self.frame += RENDER_QUANTUM as u64;
    }

    /// Fill an interleaved device buffer with `channels` channels.
    pub fn fill(&mut self, out: &mut [f32], channels: usize) {
        self.drain_commands();

        if !self.running || channels == 0 {
            out.fill(0.0);
            return;
        }

        for frame in out.chunks_mut(channels) {
            if self.cursor >= RENDER_QUANTUM {
                self.render_quantum();
                self.cursor = 0;
            }
            let block = self
                .slot(NodeId::DESTINATION)
                .map_or(&SILENT_BLOCK, |slot| &slot.output);
            let left = block[0][self.cursor];
            let right = block[1][self.cursor];
            if channels == 1 {
                frame[0] = (left + right) * 0.5;
            } else {
                frame[0] = left;
                frame[1] = right;
                for sample in frame.iter_mut().skip(CHANNELS) {
                    *sample = 0.0;
                }
            }
            self.cursor += 1;
        }

        self.report();
    }

    fn report(&mut self) {
        let _ = self.status.push(Status::Clock(self.delivered()));
        for slot in self.slots.iter_mut().flatten() {
            let id = slot.id;
            if let Some(position) = slot.processor.position()
                && slot.last_position != Some(position)
                && self.status.push(Status::Position { id, frame: position }).is_ok()
            {
                slot.last_position = Some(position);
            }
            if slot.processor.finished()
                && !slot.ended_reported
                && self.status.push(Status::Ended(id)).is_ok()
            {
                slot.ended_reported = true;
            }
        }
    }
}

impl Slot {
    fn new(id: NodeId, processor: Owned<Box<dyn Processor>>) -> Self {
        Self {
            id,
            processor,
            inputs: Vec::with_capacity(INPUT_CAPACITY),
            output: SILENT_BLOCK,
            last_position: None,
            ended_reported: false,
        }
    }
}

fn visit(slots: &[Option<Slot>], marks: &mut [bool], order: &mut Vec<NodeId>, id: NodeId) {
    let index = id.index();
    if index >= marks.len() || marks[index] {
        return;
    }
    marks[index] = true;
    let Some(slot) = slots[index].as_ref().filter(|slot| slot.id == id) else {
        return;
    };
    for input in &slot.inputs {
        visit(slots, marks, order, *input);
    }
    order.push(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::gain::Gain;
    use crate::dsp::source::BufferSource;
    use basedrop::Collector;
    use beatlayer_transport::AudioArc;

    struct Rig {
        graph: Graph,
        commands: rtrb::Producer<Command>,
        status: rtrb::Consumer<Status>,
        collector: Collector,
    }

    fn rig() -> Rig {
        let collector = Collector::new();
        let (commands, command_rx) = rtrb::RingBuffer::new(64);
        let (status_tx, status) = rtrb::RingBuffer::new(256);
        let graph = Graph::new(1000.0, 16, &collector.handle(), command_rx, status_tx);
        Rig {
            graph,
            commands,
            status,
            collector,
        }
    }

    impl Rig {
        fn add(&mut self, id: u32, processor: Box<dyn Processor>) {
            let processor = Owned::new(&self.collector.handle(), processor);
            let _ = self.commands.push(Command::Add {
                id: NodeId::new(id),
                processor,
            });
        }

        fn send(&mut self, command: Command) {
            let _ = self.commands.push(command);
        }
    }

    fn constant(frames: usize, value: f32) -> AudioArc {
        AudioArc::new(vec![value; frames], 1000, 1)
    }

    #[test]
    fn test_inputs_are_summed_through_gain() {
        let mut rig = rig();
        rig.add(1, Box::new(BufferSource::new(constant(512, 0.25))));
        rig.add(2, Box::new(BufferSource::new(constant(512, 0.5))));
        rig.add(3, Box::new(Gain::new(2.0, 1000.0)));
        for (from, to) in [(1, 3), (2, 3), (3, 0)] {
            rig.send(Command::Connect {
                from: NodeId::new(from),
                to: NodeId::new(to),
            });
        }
        for id in [1, 2] {
            rig.send(Command::Source {
                id: NodeId::new(id),
                command: SourceCommand::StartAt(0),
            });
        }
        rig.send(Command::SetRunning(true));

        let mut out = vec![0.0f32; 2 * 64];
        rig.graph.fill(&mut out, 2);
        assert!((out[0] - 1.5).abs() < 1.0e-6);
        assert!((out[1] - 1.5).abs() < 1.0e-6);
    }

    #[test]
    fn test_unconnected_nodes_are_not_rendered() {
        let mut rig = rig();
        rig.add(1, Box::new(BufferSource::new(constant(512, 1.0))));
        rig.send(Command::Source {
            id: NodeId::new(1),
            command: SourceCommand::StartAt(0),
        });
        rig.send(Command::SetRunning(true));

        let mut out = vec![0.0f32; 2 * 128];
        rig.graph.fill(&mut out, 2);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_suspended_graph_holds_clock() {
        let mut rig = rig();
        let mut out = vec![1.0f32; 2 * 300];
        rig.graph.fill(&mut out, 2);
        assert_eq!(rig.graph.frame(), 0);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_odd_device_buffers_stay_continuous() {
        let mut rig = rig();
        let ramp = AudioArc::new((0..1000).map(|i| i as f32).collect(), 1000, 1);
        rig.add(1, Box::new(BufferSource::new(ramp)));
        rig.send(Command::Connect {
            from: NodeId::new(1),
            to: NodeId::DESTINATION,
        });
        rig.send(Command::Source {
            id: NodeId::new(1),
            command: SourceCommand::StartAt(0),
        });
        rig.send(Command::SetRunning(true));

        let mut collected = Vec::new();
        for size in [100, 37, 200] {
            let mut out = vec![0.0f32; size];
            rig.graph.fill(&mut out, 1);
            collected.extend(out);
        }
        assert_eq!(collected.len(), 337);
        assert!(collected.iter().enumerate().all(|(i, s)| *s == i as f32));
    }

    #[test]
    fn test_batch_applies_as_a_unit_and_reports_end() {
        let mut rig = rig();
        let handle = rig.collector.handle();
        let source: Box<dyn Processor> = Box::new(BufferSource::new(constant(100, 1.0)));
        let batch = vec![
            Command::Add {
                id: NodeId::new(4),
                processor: Owned::new(&handle, source),
            },
            Command::Connect {
                from: NodeId::new(4),
                to: NodeId::DESTINATION,
            },
            Command::Source {
                id: NodeId::new(4),
                command: SourceCommand::StartAt(0),
            },
            Command::SetRunning(true),
        ];
        rig.send(Command::Batch(Owned::new(&handle, batch)));

        let mut out = vec![0.0f32; 2 * 256];
        rig.graph.fill(&mut out, 2);
        assert_eq!(out[0], 1.0);
        assert_eq!(out[2 * 100], 0.0);

        let mut statuses = Vec::new();
        while let Ok(status) = rig.status.pop() {
            statuses.push(status);
        }
        assert!(statuses.contains(&Status::Clock(256)));
        assert!(statuses.contains(&Status::Ended(NodeId::new(4))));
    }

    #[test]
    fn test_remove_drops_edges() {
        let mut rig = rig();
        rig.add(1, Box::new(BufferSource::new(constant(512, 1.0))));
        rig.send(Command::Connect {
            from: NodeId::new(1),
            to: NodeId::DESTINATION,
        });
        rig.send(Command::Source {
            id: NodeId::new(1),
            command: SourceCommand::StartAt(0),
        });
        rig.send(Command::SetRunning(true));
        rig.send(Command::Remove(NodeId::new(1)));

        let mut out = vec![0.0f32; 2 * 128];
        rig.graph.fill(&mut out, 2);
        assert!(out.iter().all(|s| *s == 0.0));
        rig.collector.collect();
    }

    #[test]
    fn test_clock_reports_delivered_frames() {
        let mut rig = rig();
        rig.send(Command::SetRunning(true));
        for size in [100, 37] {
            let mut out = vec![0.0f32; size];
            rig.graph.fill(&mut out, 1);
        }
        let mut clocks = Vec::new();
        while let Ok(status) = rig.status.pop() {
            if let Status::Clock(frame) = status {
                clocks.push(frame);
            }
        }
        assert_eq!(clocks, vec![100, 137]);
        assert_eq!(rig.graph.frame(), 256);
    }

    #[test]
    fn test_stale_id_does_not_touch_reused_slot() {
        let mut rig = rig();
        let old = NodeId::new(1);
        let fresh = old.next_generation();
        rig.add(1, Box::new(BufferSource::new(constant(512, 1.0))));
        rig.send(Command::Remove(old));
        let processor: Box<dyn Processor> = Box::new(BufferSource::new(constant(512, 1.0)));
        let processor = Owned::new(&rig.collector.handle(), processor);
        rig.send(Command::Add {
            id: fresh,
            processor,
        });
        rig.send(Command::Connect {
            from: fresh,
            to: NodeId::DESTINATION,
        });
        rig.send(Command::Source {
            id: fresh,
            command: SourceCommand::StartAt(0),
        });
        // commands still addressed to the old node
        rig.send(Command::Remove(old));
        rig.send(Command::Source {
            id: old,
            command: SourceCommand::Stop,
        });
        rig.send(Command::SetRunning(true));

        let mut out = vec![0.0f32; 2 * 128];
        rig.graph.fill(&mut out, 2);
        assert!(out.iter().all(|s| *s == 1.0));

        let mut positions = Vec::new();
        while let Ok(status) = rig.status.pop() {
            if let Status::Position { id, .. } = status {
                positions.push(id);
            }
        }
        assert_eq!(positions, vec![fresh]);
        rig.collector.collect();
    }
}
