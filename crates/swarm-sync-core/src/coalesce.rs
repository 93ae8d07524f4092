//! Token text coalescing.
//!
//! High-frequency token text is buffered per agent and flushed into the
//! store on a fixed cadence, so processing cost tracks the flush interval
//! rather than the backend's send rate.

use std::collections::HashMap;

use crate::agent::truncate_front;

#[derive(Debug, Default)]
struct Pending {
    text: String,
    chars: usize,
}

/// Per-agent pending output, bounded to a character limit.
#[derive(Debug)]
pub struct OutputCoalescer {
    pending: HashMap<String, Pending>,
    /// Agents in first-buffered order, so flushes are deterministic.
    order: Vec<String>,
    limit: usize,
}

impl OutputCoalescer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            pending: HashMap::new(),
            order: Vec::new(),
            limit,
        }
    }

    /// Buffer text for an agent.
    pub fn push(&mut self, agent_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        let entry = self.pending.entry(agent_id.to_string()).or_insert_with(|| {
            self.order.push(agent_id.to_string());
            Pending::default()
        });
        entry.text.push_str(text);
        entry.chars += text.chars().count();
        if entry.chars > self.limit {
            truncate_front(&mut entry.text, self.limit);
            entry.chars = self.limit;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take the buffered text for one agent.
    pub fn take(&mut self, agent_id: &str) -> Option<String> {
        let pending = self.pending.remove(agent_id)?;
        self.order.retain(|id| id != agent_id);
        Some(pending.text)
    }

    /// Take every buffered chunk in first-buffered order.
    pub fn drain(&mut self) -> Vec<(String, String)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p.text)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.order.clear();
    }
}
