//! Playback core of beatlayer: the shared graph, per-clip playback, the
//! four-layer mixer, per-clip effects chains and the part sequencer.

pub mod cache;
pub mod chops;
pub mod clip_player;
pub mod config;
pub mod effects;
pub mod graph_manager;
pub mod mixer;
pub mod sequencer;
pub mod session;

pub use cache::BufferCache;
pub use chops::{Chop, create_chops};
pub use clip_player::{ClipPlayer, PlaybackHandle};
pub use config::EngineConfig;
pub use effects::{EffectStage, EffectsChain, NodeFactory};
pub use graph_manager::GraphManager;
pub use mixer::{LayerState, Mixer};
pub use sequencer::{PartSequencer, SequencerEvent, SequencerState};
pub use session::Session;

pub use beatlayer_engine::{AudioContext, ContextState, GraphError, NodeId, NodeKind};
pub use beatlayer_transport::{
    AudioArc, AudioChop, AudioClip, ClipId, EffectsConfig, FilterType, LayerKey, SongPart,
};
