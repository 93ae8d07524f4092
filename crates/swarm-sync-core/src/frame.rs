//! Frame model for the execution event stream.
//!
//! A frame is either a [`TokenFrame`] (incremental agent output) or a
//! [`ControlFrame`] (structural or lifecycle event). Control payloads are
//! decoded into the closed [`ControlEvent`] union at the boundary so the
//! interpreter never handles untyped JSON.

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Epoch milliseconds.
pub type Timestamp = i64;

/// Frame decoding error.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Frame is not a JSON object")]
    NotAnObject,
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),
    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

/// One unit of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Token(TokenFrame),
    Control(ControlFrame),
}

impl Frame {
    /// Execution this frame belongs to.
    #[must_use]
    pub fn exec_id(&self) -> &str {
        match self {
            Self::Token(t) => &t.exec_id,
            Self::Control(c) => &c.exec_id,
        }
    }

    /// Decode a frame from a JSON value.
    ///
    /// Objects carrying `seq` whose `type` is absent or `"token"` are token
    /// frames; everything else must name a known control event.
    ///
    /// # Errors
    /// Returns error if the value is not a frame or names an unknown event.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(mut obj) = value else {
            return Err(FrameError::NotAnObject);
        };

        let kind = match obj.get("type") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(FrameError::MissingField("type")),
            None => None,
        };

        if kind.as_deref().is_none_or(|k| k == "token") {
            if !obj.contains_key("seq") {
                return Err(FrameError::MissingField("seq"));
            }
            obj.remove("type");
            let token: TokenFrame = serde_json::from_value(Value::Object(obj))?;
            return Ok(Self::Token(token));
        }

        let kind = kind.unwrap_or_default();
        let exec_id = match obj.remove("exec_id") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let agent_id = match obj.remove("agent_id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        };
        let ts = match obj.remove("ts") {
            Some(v) => parse_timestamp(&v).unwrap_or_default(),
            None => 0,
        };
        let payload = match obj.remove("payload") {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(v) => v,
        };

        let event = ControlEvent::decode(&kind, payload)?;
        Ok(Self::Control(ControlFrame {
            exec_id,
            agent_id,
            ts,
            event,
        }))
    }
}

/// Incremental output for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFrame {
    #[serde(default)]
    pub exec_id: String,
    pub agent_id: String,
    pub seq: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default, deserialize_with = "deserialize_ts")]
    pub ts: Timestamp,
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

/// Structural or lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlFrame {
    pub exec_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub ts: Timestamp,
    #[serde(flatten)]
    pub event: ControlEvent,
}

impl ControlFrame {
    /// Build a control frame.
    #[must_use]
    pub fn new(exec_id: impl Into<String>, agent_id: Option<&str>, ts: Timestamp, event: ControlEvent) -> Self {
        Self {
            exec_id: exec_id.into(),
            agent_id: agent_id.map(str::to_string),
            ts,
            event,
        }
    }

    /// Agent this event targets: the frame-level id, else the payload's.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.agent_id.as_deref().or_else(|| self.event.subject())
    }

    /// Whether this event means the job is no longer running.
    #[must_use]
    pub fn ends_execution(&self) -> bool {
        match self.event {
            ControlEvent::SessionEnd(_) => true,
            ControlEvent::Error(_) => self.subject().is_none(),
            _ => false,
        }
    }
}

/// Closed set of control events, one typed payload per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlEvent {
    ExecutionStarted(ExecutionStarted),
    AgentStarted(AgentStarted),
    StateEntered(AgentStarted),
    StateExited(StateExited),
    AgentCompleted(AgentCompleted),
    AgentPaused(Empty),
    AgentResumed(Empty),
    Error(ErrorEvent),
    ToolUse(ToolUse),
    ParallelStart(ParallelStart),
    ParallelChildCompleted(ParallelChildCompleted),
    ParallelAggregated(ParallelAggregated),
    GraphUpdated(GraphPayload),
    StateMachineCreated(GraphPayload),
    DagStructure(GraphPayload),
    EdgeFired(EdgeFired),
    HumanDecisionRequired(HumanPrompt),
    HumanInputRequired(HumanPrompt),
    RerunStarted(RerunStarted),
    SessionEnd(SessionEnd),
    Pong(Empty),
}

impl ControlEvent {
    /// Wire names of every known event kind.
    pub const KINDS: &'static [&'static str] = &[
        "execution_started",
        "agent_started",
        "state_entered",
        "state_exited",
        "agent_completed",
        "agent_paused",
        "agent_resumed",
        "error",
        "tool_use",
        "parallel_start",
        "parallel_child_completed",
        "parallel_aggregated",
        "graph_updated",
        "state_machine_created",
        "dag_structure",
        "edge_fired",
        "human_decision_required",
        "human_input_required",
        "rerun_started",
        "session_end",
        "pong",
    ];

    fn decode(kind: &str, payload: Value) -> Result<Self, FrameError> {
        if !Self::KINDS.contains(&kind) {
            return Err(FrameError::UnknownEvent(kind.to_string()));
        }
        let mut tagged = Map::new();
        tagged.insert("type".into(), Value::String(kind.to_string()));
        tagged.insert("payload".into(), payload);
        serde_json::from_value(Value::Object(tagged)).map_err(|source| FrameError::InvalidPayload {
            kind: kind.to_string(),
            source,
        })
    }

    /// Wire name of this event.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionStarted(_) => "execution_started",
            Self::AgentStarted(_) => "agent_started",
            Self::StateEntered(_) => "state_entered",
            Self::StateExited(_) => "state_exited",
            Self::AgentCompleted(_) => "agent_completed",
            Self::AgentPaused(_) => "agent_paused",
            Self::AgentResumed(_) => "agent_resumed",
            Self::Error(_) => "error",
            Self::ToolUse(_) => "tool_use",
            Self::ParallelStart(_) => "parallel_start",
            Self::ParallelChildCompleted(_) => "parallel_child_completed",
            Self::ParallelAggregated(_) => "parallel_aggregated",
            Self::GraphUpdated(_) => "graph_updated",
            Self::StateMachineCreated(_) => "state_machine_created",
            Self::DagStructure(_) => "dag_structure",
            Self::EdgeFired(_) => "edge_fired",
            Self::HumanDecisionRequired(_) => "human_decision_required",
            Self::HumanInputRequired(_) => "human_input_required",
            Self::RerunStarted(_) => "rerun_started",
            Self::SessionEnd(_) => "session_end",
            Self::Pong(_) => "pong",
        }
    }

    fn subject(&self) -> Option<&str> {
        match self {
            Self::AgentStarted(p) | Self::StateEntered(p) => p.state.as_deref(),
            Self::StateExited(p) => p.state.as_deref(),
            Self::ParallelStart(p) => p.state.as_deref(),
            Self::ParallelChildCompleted(p) => p.parent.as_deref(),
            Self::ParallelAggregated(p) => p.state.as_deref(),
            Self::HumanDecisionRequired(p) | Self::HumanInputRequired(p) => p.state.as_deref(),
            _ => None,
        }
    }
}

/// Payload for events that carry no fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionStarted {
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStarted {
    /// State id when the frame carries no `agent_id`.
    pub state: Option<String>,
    pub name: Option<String>,
    pub parent: Option<String>,
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateExited {
    pub state: Option<String>,
    pub result: Option<Value>,
    #[serde(alias = "nextEvent")]
    pub next_event: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCompleted {
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorEvent {
    #[serde(alias = "error")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolUse {
    #[serde(alias = "tool_name")]
    pub tool: String,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelStart {
    pub state: Option<String>,
    #[serde(alias = "child_states")]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelChildCompleted {
    /// Fan-out owner when the frame carries no `agent_id`.
    pub parent: Option<String>,
    #[serde(alias = "child_id")]
    pub child: String,
    pub event: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelAggregated {
    pub state: Option<String>,
    #[serde(alias = "nextEvent")]
    pub next_event: Option<String>,
}

/// Node description inside a graph event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub id: String,
    pub label: Option<String>,
    pub parent: Option<String>,
    /// Open attributes merged into the node's `extra` map.
    pub data: Option<Value>,
}

/// Edge description inside a graph event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeSpec {
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(alias = "event")]
    pub label: Option<String>,
}

impl EdgeSpec {
    /// Edge id, derived from the endpoints when absent.
    #[must_use]
    pub fn edge_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.source, self.target))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphPayload {
    #[serde(alias = "states")]
    pub nodes: Vec<NodeSpec>,
    #[serde(alias = "transitions")]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeFired {
    pub edge_id: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub event: Option<String>,
}

impl EdgeFired {
    /// Edge id, derived from the endpoints when absent.
    #[must_use]
    pub fn resolve_id(&self) -> Option<String> {
        if let Some(id) = &self.edge_id {
            return Some(id.clone());
        }
        match (&self.source, &self.target) {
            (Some(s), Some(t)) => Some(format!("{s}->{t}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanPrompt {
    pub state: Option<String>,
    #[serde(alias = "question")]
    pub prompt: Option<String>,
    #[serde(alias = "allowed_options")]
    pub options: Vec<String>,
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerunStarted {
    #[serde(alias = "from_state")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionEnd {
    pub status: Option<String>,
}

/// Parse a wire timestamp: epoch milliseconds or RFC 3339.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as Timestamp)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

fn deserialize_ts<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value).unwrap_or_default())
}
