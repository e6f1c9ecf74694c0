use crate::node::{NodeId, ParamKind};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("audio context is closed")]
    ContextClosed,

    #[error("node limit of {limit} reached")]
    NodeLimit { limit: usize },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("connecting {from} -> {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },

    #[error("media element '{0}' already has a graph source")]
    AlreadyAttached(String),

    #[error("node {node} has no {param:?} parameter")]
    UnknownParam { node: NodeId, param: ParamKind },

    #[error("node {0} is not a playback source")]
    NotASource(NodeId),

    #[error("no output device found")]
    NoOutputDevice,

    #[error("unsupported sample format '{0}'")]
    UnsupportedSampleFormat(String),

    #[error("output stream error: {0}")]
    Stream(String),
}
