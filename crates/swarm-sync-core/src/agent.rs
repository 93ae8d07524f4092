//! Agent records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::Timestamp;

/// Agent identifier.
pub type AgentId = String;

/// Agent status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Known but not yet entered.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Waiting on a human decision or input.
    NeedsInput,
    /// Suspended by the backend.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error or stopped mid-flight.
    Failed,
}

impl AgentStatus {
    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::NeedsInput | Self::Paused => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Whether the agent has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    ///
    /// Transitions only move forward, except that a suspended agent
    /// (`needs_input` or `paused`) may resume running and any non-terminal
    /// agent may fail.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::NeedsInput | Self::Paused, Self::Running) => true,
            (_, Self::Failed) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

/// One execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    /// Most recent output, bounded by the configured character limit.
    pub output: String,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub duration_ms: Option<i64>,
    pub parent: Option<AgentId>,
    pub depth: u32,
    pub error: Option<String>,
    pub result: Option<Value>,
    /// Tool names in first-use order, without repeats.
    pub tools_used: Vec<String>,
    pub current_action: Option<String>,
    pub execution_order: Option<u64>,
    /// Set once a terminal token frame has been seen.
    pub stream_closed: bool,
}

impl Agent {
    /// Create a pending agent.
    #[must_use]
    pub fn new(id: impl Into<AgentId>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            status: AgentStatus::Pending,
            output: String::new(),
            start_time: None,
            end_time: None,
            duration_ms: None,
            parent: None,
            depth: 0,
            error: None,
            result: None,
            tools_used: Vec::new(),
            current_action: None,
            execution_order: None,
            stream_closed: false,
        }
    }

    /// Apply a status change if it is a legal lifecycle step.
    ///
    /// Returns whether the status changed.
    pub fn transition(&mut self, next: AgentStatus) -> bool {
        if self.status == next || !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Start a new activation, including re-entry of a finished state.
    /// Callers filter replayed entries.
    pub fn activate(&mut self, ts: Timestamp, order: u64) {
        self.status = AgentStatus::Running;
        self.start_time = Some(ts);
        self.end_time = None;
        self.duration_ms = None;
        self.error = None;
        self.execution_order = Some(order);
        self.stream_closed = false;
    }

    /// Record a terminal state and derive the duration from the start time.
    pub fn finish(&mut self, status: AgentStatus, ts: Timestamp) -> bool {
        if !self.transition(status) {
            return false;
        }
        self.end_time = Some(ts);
        self.duration_ms = self.start_time.map(|start| (ts - start).max(0));
        self.current_action = None;
        true
    }

    /// Add a tool to the usage set. Returns whether it was new.
    pub fn record_tool(&mut self, tool: &str) -> bool {
        if self.tools_used.iter().any(|t| t == tool) {
            return false;
        }
        self.tools_used.push(tool.to_string());
        true
    }

    /// Append output text, keeping at most `limit` trailing characters.
    pub fn append_output(&mut self, text: &str, limit: usize) {
        self.output.push_str(text);
        truncate_front(&mut self.output, limit);
    }

    /// Return to `pending`, dropping everything the last run produced.
    pub fn reset(&mut self) {
        self.status = AgentStatus::Pending;
        self.output.clear();
        self.start_time = None;
        self.end_time = None;
        self.duration_ms = None;
        self.error = None;
        self.result = None;
        self.tools_used.clear();
        self.current_action = None;
        self.execution_order = None;
        self.stream_closed = false;
    }
}

/// Drop leading characters until at most `limit` remain.
pub(crate) fn truncate_front(s: &mut String, limit: usize) {
    let count = s.chars().count();
    if count <= limit {
        return;
    }
    let cut = s
        .char_indices()
        .nth(count - limit)
        .map_or(s.len(), |(i, _)| i);
    s.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut agent = Agent::new("a");
        assert!(agent.transition(AgentStatus::Running));
        assert!(agent.transition(AgentStatus::NeedsInput));
        assert!(agent.transition(AgentStatus::Running));
        assert!(agent.transition(AgentStatus::Completed));
        assert!(!agent.transition(AgentStatus::Running));
        assert!(!agent.transition(AgentStatus::Failed));
    }

    #[test]
    fn test_running_to_failed() {
        let mut agent = Agent::new("a");
        agent.activate(10, 1);
        assert!(agent.finish(AgentStatus::Failed, 25));
        assert_eq!(agent.duration_ms, Some(15));
    }

    #[test]
    fn test_no_backwards_to_pending() {
        let mut agent = Agent::new("a");
        agent.activate(0, 1);
        assert!(!agent.transition(AgentStatus::Pending));
        assert_eq!(agent.status, AgentStatus::Running);
    }

    #[test]
    fn test_activate_after_completion() {
        let mut agent = Agent::new("a");
        agent.activate(0, 1);
        agent.finish(AgentStatus::Completed, 5);
        agent.activate(10, 2);
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.end_time, None);
        assert_eq!(agent.execution_order, Some(2));
    }

    #[test]
    fn test_tool_set_is_idempotent() {
        let mut agent = Agent::new("a");
        assert!(agent.record_tool("search"));
        assert!(!agent.record_tool("search"));
        assert!(agent.record_tool("fetch"));
        assert_eq!(agent.tools_used, vec!["search", "fetch"]);
    }

    #[test]
    fn test_output_keeps_tail() {
        let mut agent = Agent::new("a");
        agent.append_output("héllo", 10);
        agent.append_output(" wörld!", 10);
        assert_eq!(agent.output, "llo wörld!");
    }
}
