//! Collaborator interfaces: canvas, layout engine, session storage.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::graph::{Direction, Edge, GraphSnapshot, Node, Position};

/// How the graph's edges are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphMode {
    /// Edges follow `agent.parent`.
    #[default]
    Tree,
    /// Edges come from an explicit transition graph.
    StateMachine,
}

/// Kind of human interaction requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Decision,
    Input,
}

/// Modal prompt for the UI to resolve.
///
/// The reply travels back as an ordinary outbound transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub kind: PromptKind,
    pub state_id: String,
    pub prompt: Option<String>,
    pub options: Vec<String>,
    pub schema: Option<Value>,
}

/// Event produced for the canvas collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CanvasEvent {
    /// Full read-only graph, positions included.
    Snapshot(GraphSnapshot),
    /// Bring a node into view.
    Focus(String),
    /// Ask the user for a decision or input.
    Modal(PromptRequest),
    /// Top-level, user-visible error.
    Error(String),
}

impl CanvasEvent {
    /// Route this event to the matching sink callback.
    pub fn deliver<C: CanvasSink + ?Sized>(self, sink: &C) {
        match self {
            Self::Snapshot(snapshot) => sink.on_snapshot(snapshot),
            Self::Focus(id) => sink.on_focus_request(&id),
            Self::Modal(prompt) => sink.on_modal_request(prompt),
            Self::Error(message) => sink.on_error(&message),
        }
    }
}

/// Receiver of canvas events.
pub trait CanvasSink: Send + Sync {
    fn on_snapshot(&self, snapshot: GraphSnapshot);

    fn on_focus_request(&self, node_id: &str);

    fn on_modal_request(&self, prompt: PromptRequest);

    /// Top-level errors. Ignored unless overridden.
    fn on_error(&self, _message: &str) {}
}

/// Pure graph layout function.
pub trait LayoutEngine: Send + Sync {
    fn layout(&self, nodes: &[Node], edges: &[Edge], direction: Direction) -> HashMap<String, Position>;
}

/// Entry in the persisted session list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Execution id.
    pub id: String,
    pub title: String,
    /// Creation timestamp (epoch milliseconds).
    pub timestamp: i64,
    pub mode: GraphMode,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Key-value storage for the session list.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Insert or replace a record.
    async fn put(&self, record: SessionRecord) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, StorageError>;

    /// Newest first, at most `limit` entries.
    async fn list(&self, limit: Option<usize>) -> Result<Vec<SessionRecord>, StorageError>;

    async fn remove(&self, id: &str) -> Result<(), StorageError>;
}
