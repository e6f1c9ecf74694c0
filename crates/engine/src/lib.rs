//! Audio processing context: a pull-based node graph rendered in fixed
//! quanta on a real-time thread, controlled through a lock-free command
//! queue.

pub mod context;
pub mod device;
pub mod dsp;
pub mod error;
pub mod graph;
pub mod node;
pub mod param;

pub use context::{
    AudioContext, ContextOptions, ContextState, DEFAULT_MAX_NODES, DEFAULT_OFFLINE_SAMPLE_RATE,
};
pub use error::GraphError;
pub use node::{NodeId, NodeKind, NodeSpec, Oversample, ParamKind, RENDER_QUANTUM, SourceCommand};
pub use param::{AudioParam, ParamChange};
