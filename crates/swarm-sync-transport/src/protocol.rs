//! Wire protocol for the execution event stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use swarm_sync_core::frame::{Frame, FrameError};
use thiserror::Error;

/// Message from client to backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive; the backend answers with `pong`.
    Ping,
    /// Answer to `human_decision_required`.
    HumanDecision { state_id: String, decision: String },
    /// Answer to `human_input_required`.
    HumanInput { state_id: String, input: Value },
}

/// Inbound decoding error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Where a stream subscription begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Full backlog from the first event.
    Beginning,
    /// Only events after the last delivered one.
    Latest,
}

impl StartFrom {
    #[must_use]
    pub const fn for_resume(resume: bool) -> Self {
        if resume { Self::Latest } else { Self::Beginning }
    }

    /// Query value for `start_from`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Beginning => "0",
            Self::Latest => "$",
        }
    }
}

/// Stream endpoint for one execution.
#[must_use]
pub fn stream_url(base: &str, exec_id: &str, start: StartFrom) -> String {
    format!(
        "{}/ws/{exec_id}?start_from={}",
        base.trim_end_matches('/'),
        start.as_str()
    )
}

/// Decode one text message into a frame.
///
/// # Errors
/// Returns error if the text is not JSON or not a known frame.
pub fn parse_frame(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    Ok(Frame::from_value(value)?)
}
