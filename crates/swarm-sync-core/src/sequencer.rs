//! Per-agent token ordering filter.

use std::collections::HashMap;

use crate::frame::{ControlEvent, Frame, TokenFrame};

/// Why a token frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Same `seq` as the last admitted frame.
    Duplicate,
    /// Older than the last admitted frame.
    Stale,
}

/// Drops duplicate and stale token frames before they reach the store.
///
/// Counters exist only for agents with an admitted token, so the first
/// frame of an agent is always admitted whatever its `seq`.
#[derive(Debug, Default)]
pub struct FrameSequencer {
    last_seq: HashMap<String, u64>,
}

impl FrameSequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `frame` should be forwarded to the interpreter.
    ///
    /// Control frames are always admitted; a sequence-resetting control
    /// event also clears every counter.
    pub fn admit(&mut self, frame: &Frame) -> bool {
        match frame {
            Frame::Token(token) => self.check_token(token).is_ok(),
            Frame::Control(control) => {
                if matches!(
                    control.event,
                    ControlEvent::ExecutionStarted(_) | ControlEvent::RerunStarted(_)
                ) {
                    self.reset();
                }
                true
            }
        }
    }

    /// Check a token frame and record it on admission.
    ///
    /// # Errors
    /// Returns the rejection reason for duplicate or stale frames.
    pub fn check_token(&mut self, token: &TokenFrame) -> Result<(), Rejection> {
        if let Some(&last) = self.last_seq.get(&token.agent_id) {
            if token.seq == last && !token.is_final {
                tracing::debug!(agent = %token.agent_id, seq = token.seq, "duplicate token dropped");
                return Err(Rejection::Duplicate);
            }
            if token.seq < last && !token.is_final {
                tracing::debug!(agent = %token.agent_id, seq = token.seq, last, "stale token dropped");
                return Err(Rejection::Stale);
            }
        }
        let entry = self.last_seq.entry(token.agent_id.clone()).or_insert(0);
        *entry = (*entry).max(token.seq);
        Ok(())
    }

    /// Forget every counter.
    pub fn reset(&mut self) {
        self.last_seq.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(agent: &str, seq: u64, is_final: bool) -> TokenFrame {
        TokenFrame {
            exec_id: "exec_1".into(),
            agent_id: agent.into(),
            seq,
            text: format!("t{seq}"),
            ts: 0,
            is_final,
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut seq = FrameSequencer::new();
        assert!(seq.check_token(&token("a", 0, false)).is_ok());
        assert_eq!(seq.check_token(&token("a", 0, false)), Err(Rejection::Duplicate));
    }

    #[test]
    fn test_out_of_order_drops_stale() {
        let mut seq = FrameSequencer::new();
        let admitted: Vec<u64> = [0, 2, 1]
            .into_iter()
            .filter(|&n| seq.check_token(&token("a", n, false)).is_ok())
            .collect();
        assert_eq!(admitted, vec![0, 2]);
        assert_eq!(seq.check_token(&token("a", 2, false)), Err(Rejection::Duplicate));
    }

    #[test]
    fn test_final_admitted_when_stale() {
        let mut seq = FrameSequencer::new();
        seq.check_token(&token("a", 5, false)).unwrap();
        assert!(seq.check_token(&token("a", 3, true)).is_ok());
        assert_eq!(seq.check_token(&token("a", 4, false)), Err(Rejection::Stale));
    }

    #[test]
    fn test_agents_are_independent() {
        let mut seq = FrameSequencer::new();
        seq.check_token(&token("a", 4, false)).unwrap();
        assert!(seq.check_token(&token("b", 1, false)).is_ok());
    }

    #[test]
    fn test_reset_event_clears_counters() {
        use crate::frame::{ControlFrame, ExecutionStarted};

        let mut seq = FrameSequencer::new();
        seq.check_token(&token("a", 4, false)).unwrap();
        let reset = Frame::Control(ControlFrame::new(
            "exec_1",
            None,
            0,
            ControlEvent::ExecutionStarted(ExecutionStarted::default()),
        ));
        assert!(seq.admit(&reset));
        assert!(seq.admit(&Frame::Token(token("a", 1, false))));
    }
}
