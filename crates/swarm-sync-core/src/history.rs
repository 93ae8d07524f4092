//! Undo/redo over graph snapshots and replay over the execution trace.

use std::collections::VecDeque;

use crate::graph::GraphSnapshot;

/// A recorded graph plus the graph's stamp clock when it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub graph: GraphSnapshot,
    pub mark: u64,
}

/// Bounded undo/redo ring.
///
/// Only explicit user edits are recorded; streamed updates never are.
#[derive(Debug)]
pub struct UndoHistory {
    entries: VecDeque<Checkpoint>,
    cursor: usize,
    limit: usize,
}

impl UndoHistory {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(64)),
            cursor: 0,
            limit: limit.max(1),
        }
    }

    /// Record a snapshot, dropping any redo future and the oldest entry
    /// beyond the limit.
    pub fn push(&mut self, checkpoint: Checkpoint) {
        if !self.entries.is_empty() {
            self.entries.truncate(self.cursor + 1);
        }
        self.entries.push_back(checkpoint);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len() - 1;
    }

    /// Overwrite the entry under the cursor, or record one if empty.
    pub fn refresh(&mut self, checkpoint: Checkpoint) {
        match self.entries.get_mut(self.cursor) {
            Some(entry) => *entry = checkpoint,
            None => self.push(checkpoint),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    /// Step back, returning the checkpoint to restore.
    pub fn undo(&mut self) -> Option<&Checkpoint> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor)
    }

    /// Step forward, returning the checkpoint to restore.
    pub fn redo(&mut self) -> Option<&Checkpoint> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        self.entries.get(self.cursor)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

/// Cursor over the execution trace for step-by-step replay.
///
/// Moving the cursor never touches agent state.
#[derive(Debug, Default)]
pub struct ReplayCursor {
    index: Option<usize>,
}

impl ReplayCursor {
    #[must_use]
    pub const fn new() -> Self {
        Self { index: None }
    }

    #[must_use]
    pub const fn index(&self) -> Option<usize> {
        self.index
    }

    /// Jump to `index`. Returns the selected agent id.
    pub fn seek<'a>(&mut self, trace: &'a [String], index: usize) -> Option<&'a str> {
        let id = trace.get(index)?;
        self.index = Some(index);
        Some(id)
    }

    /// Advance one step; the first step selects the start of the trace.
    pub fn step_forward<'a>(&mut self, trace: &'a [String]) -> Option<&'a str> {
        let next = self.index.map_or(0, |i| i + 1);
        self.seek(trace, next)
    }

    pub fn step_back<'a>(&mut self, trace: &'a [String]) -> Option<&'a str> {
        let prev = self.index?.checked_sub(1)?;
        self.seek(trace, prev)
    }

    pub fn clear(&mut self) {
        self.index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    fn snap(ids: &[&str]) -> Checkpoint {
        Checkpoint {
            graph: GraphSnapshot {
                nodes: ids.iter().map(|id| Node::new(*id, *id)).collect(),
                edges: Vec::new(),
            },
            mark: 0,
        }
    }

    fn ids(checkpoint: &Checkpoint) -> Vec<&str> {
        checkpoint.graph.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_undo_redo() {
        let mut history = UndoHistory::new(50);
        history.push(snap(&[]));
        history.push(snap(&["a"]));
        history.push(snap(&["a", "b"]));

        assert_eq!(ids(history.undo().unwrap()), vec!["a"]);
        assert_eq!(ids(history.undo().unwrap()), Vec::<&str>::new());
        assert!(history.undo().is_none());
        assert_eq!(ids(history.redo().unwrap()), vec!["a"]);
    }

    #[test]
    fn test_push_discards_future() {
        let mut history = UndoHistory::new(50);
        history.push(snap(&[]));
        history.push(snap(&["a"]));
        history.undo();
        history.push(snap(&["b"]));
        assert!(!history.can_redo());
        assert_eq!(history.len(), 2);
        assert_eq!(ids(history.undo().unwrap()), Vec::<&str>::new());
    }

    #[test]
    fn test_refresh_overwrites_cursor_entry() {
        let mut history = UndoHistory::new(50);
        history.refresh(snap(&["a"]));
        assert_eq!(history.len(), 1);
        history.push(snap(&["a", "b"]));
        history.undo();
        history.refresh(snap(&["a", "c"]));
        assert_eq!(history.len(), 2);
        assert!(history.undo().is_none());
        assert_eq!(ids(history.redo().unwrap()), vec!["a", "b"]);
        assert_eq!(ids(history.undo().unwrap()), vec!["a", "c"]);
    }

    #[test]
    fn test_ring_is_bounded() {
        let mut history = UndoHistory::new(3);
        for id in ["a", "b", "c", "d", "e"] {
            history.push(snap(&[id]));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(ids(history.undo().unwrap()), vec!["d"]);
        assert_eq!(ids(history.undo().unwrap()), vec!["c"]);
        assert!(history.undo().is_none());
    }

    #[test]
    fn test_replay_steps() {
        let trace: Vec<String> = ["root", "child1", "child2"].iter().map(|s| (*s).to_string()).collect();
        let mut cursor = ReplayCursor::new();
        assert_eq!(cursor.step_back(&trace), None);
        assert_eq!(cursor.step_forward(&trace), Some("root"));
        assert_eq!(cursor.step_forward(&trace), Some("child1"));
        assert_eq!(cursor.seek(&trace, 2), Some("child2"));
        assert_eq!(cursor.step_forward(&trace), None);
        assert_eq!(cursor.index(), Some(2));
        assert_eq!(cursor.step_back(&trace), Some("child1"));
        assert_eq!(cursor.seek(&trace, 9), None);
    }
}
