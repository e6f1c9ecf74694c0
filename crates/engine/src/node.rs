use std::sync::Arc;

use beatlayer_transport::{AudioArc, FilterType};

use crate::param::AudioParam;

/// Frames processed per graph pass.
pub const RENDER_QUANTUM: usize = 128;
/// The graph renders stereo throughout.
pub const CHANNELS: usize = 2;

pub type Block = [[f32; RENDER_QUANTUM]; CHANNELS];

pub const SILENT_BLOCK: Block = [[0.0; RENDER_QUANTUM]; CHANNELS];

/// Slot index plus the generation of that slot. Removing a node bumps the
/// generation, so an id held past `remove` never matches the slot's next
/// occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Every context's output node.
    pub const DESTINATION: NodeId = NodeId::new(0);

    pub const fn new(index: u32) -> Self {
        Self {
            index,
            generation: 0,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Id for the slot's next occupant.
    pub(crate) fn next_generation(self) -> Self {
        Self {
            index: self.index,
            generation: self.generation.wrapping_add(1),
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.generation == 0 {
            write!(f, "#{}", self.index)
        } else {
            write!(f, "#{}v{}", self.index, self.generation)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Destination,
    BufferSource,
    MediaElement,
    Gain,
    Convolver,
    Biquad,
    WaveShaper,
    Delay,
    Compressor,
}

impl NodeKind {
    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::BufferSource | NodeKind::MediaElement)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Gain,
    Frequency,
    Q,
    DelayTime,
    Feedback,
    Threshold,
    Knee,
    Ratio,
    Attack,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oversample {
    None,
    X2,
    X4,
}

impl Oversample {
    pub fn factor(&self) -> usize {
        match self {
            Oversample::None => 1,
            Oversample::X2 => 2,
            Oversample::X4 => 4,
        }
    }
}

/// Everything needed to build a node. Heavy preparation (FFT plans, curve
/// tables) happens on the control thread when a `NodeSpec` is turned into a
/// processor.
#[derive(Debug, Clone)]
pub enum NodeSpec {
    Gain {
        gain: f32,
    },
    BufferSource {
        buffer: AudioArc,
    },
    /// A pausable, seekable player, one per clip. `element` names the clip
    /// it plays; an element may only ever be attached once.
    MediaElement {
        element: String,
        buffer: AudioArc,
        volume: f32,
    },
    Convolver {
        impulse: AudioArc,
    },
    Biquad {
        kind: FilterType,
        frequency: f32,
        q: f32,
    },
    WaveShaper {
        curve: Arc<[f32]>,
        oversample: Oversample,
    },
    Delay {
        max_delay_secs: f32,
        delay_time: f32,
        feedback: f32,
    },
    Compressor {
        threshold: f32,
        knee: f32,
        ratio: f32,
        attack: f32,
        release: f32,
    },
}

impl NodeSpec {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeSpec::Gain { .. } => NodeKind::Gain,
            NodeSpec::BufferSource { .. } => NodeKind::BufferSource,
            NodeSpec::MediaElement { .. } => NodeKind::MediaElement,
            NodeSpec::Convolver { .. } => NodeKind::Convolver,
            NodeSpec::Biquad { .. } => NodeKind::Biquad,
            NodeSpec::WaveShaper { .. } => NodeKind::WaveShaper,
            NodeSpec::Delay { .. } => NodeKind::Delay,
            NodeSpec::Compressor { .. } => NodeKind::Compressor,
        }
    }

    /// Initial parameter values, mirrored on the control side.
    pub fn params(&self) -> Vec<(ParamKind, f32)> {
        match self {
            NodeSpec::Gain { gain } => vec![(ParamKind::Gain, *gain)],
            NodeSpec::Biquad { frequency, q, .. } => {
                vec![(ParamKind::Frequency, *frequency), (ParamKind::Q, *q)]
            }
            NodeSpec::Delay {
                delay_time,
                feedback,
                ..
            } => vec![
                (ParamKind::DelayTime, *delay_time),
                (ParamKind::Feedback, *feedback),
            ],
            NodeSpec::Compressor {
                threshold,
                knee,
                ratio,
                attack,
                release,
            } => vec![
                (ParamKind::Threshold, *threshold),
                (ParamKind::Knee, *knee),
                (ParamKind::Ratio, *ratio),
                (ParamKind::Attack, *attack),
                (ParamKind::Release, *release),
            ],
            _ => Vec::new(),
        }
    }
}

/// Transport commands understood by source nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceCommand {
    /// Begin at an absolute frame of the render clock.
    StartAt(u64),
    Stop,
    Play,
    Pause,
    /// Move the playhead, in frames of the source buffer.
    Seek(f64),
    SetLoop(bool),
    SetRate(f32),
    SetElementVolume(f32),
}

#[derive(Debug, Clone, Copy)]
pub struct RenderInfo {
    /// Absolute frame of the first sample in the block.
    pub frame: u64,
    pub sample_rate: f32,
}

/// Render-side half of a node.
pub trait Processor: Send {
    fn process(&mut self, input: &Block, output: &mut Block, info: &RenderInfo);

    fn param_mut(&mut self, _param: ParamKind) -> Option<&mut AudioParam> {
        None
    }

    fn command(&mut self, _command: SourceCommand) {}

    /// Playhead in buffer frames, for sources that report one.
    fn position(&self) -> Option<f64> {
        None
    }

    /// True once a source has played out and will stay silent.
    fn finished(&self) -> bool {
        false
    }

    fn is_active(&self) -> bool {
        false
    }
}
