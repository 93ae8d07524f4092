//! Synchronizer errors.
//!
//! Backend events never produce errors: an event that cannot apply is a
//! no-op. These errors cover user commands and configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Edge not found: {0}")]
    EdgeNotFound(String),
    #[error("Edge already exists: {0}")]
    EdgeExists(String),
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),
    #[error("Nothing to {0}")]
    HistoryExhausted(&'static str),
    #[error("Replay index {index} out of range (trace length {len})")]
    ReplayOutOfRange { index: usize, len: usize },
    #[error("Configuration error: {0}")]
    Config(String),
}
