//! Client-side execution-state synchronization for streamed swarm runs.
//!
//! This crate provides the building blocks:
//! - `Frame` - Typed wire frames (tokens and control events)
//! - `FrameSequencer` - Per-agent duplicate and stale-token rejection
//! - `ExecutionStore` - Canonical agents, graph, and trace for one execution
//! - `ExecutionSync` - Drives the store from frames and clock ticks
//! - `CanvasFeed` - Broadcast of canvas events with latest-snapshot replay
//! - Canvas, layout, and storage traits

pub mod agent;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod feed;
pub mod frame;
pub mod graph;
pub mod history;
pub mod interpreter;
pub mod layout;
pub mod sequencer;
pub mod store;
pub mod sync;
pub mod timer;
pub mod traits;

pub use agent::{Agent, AgentId, AgentStatus};
pub use config::SyncConfig;
pub use error::SyncError;
pub use feed::CanvasFeed;
pub use frame::{ControlEvent, ControlFrame, Frame, FrameError, Timestamp, TokenFrame};
pub use graph::{Direction, Edge, GraphSnapshot, Node, Position};
pub use interpreter::Effect;
pub use layout::LayeredLayout;
pub use sequencer::FrameSequencer;
pub use store::ExecutionStore;
pub use sync::ExecutionSync;
pub use timer::Millis;
pub use traits::{
    CanvasEvent, CanvasSink, GraphMode, LayoutEngine, PromptKind, PromptRequest, SessionRecord, SessionStorage,
    StorageError,
};
