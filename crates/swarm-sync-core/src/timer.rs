//! Keyed timers over a virtual millisecond clock.
//!
//! The synchronizer never sleeps. It schedules keys with a deadline and the
//! driver calls [`Timers::take_due`] with the current time, so tests can
//! fast-forward deterministically.

use std::collections::HashMap;

/// Milliseconds on the synchronizer's clock.
pub type Millis = u64;

/// What a timer does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Debounced graph layout.
    Layout,
    /// Flush coalesced token text into agent output.
    OutputFlush,
    /// Clear the transient `active` flag on an edge.
    EdgePulse(String),
}

#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKey, Millis>,
}

impl Timers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` at `now + delay`, replacing any earlier schedule.
    pub fn schedule(&mut self, key: TimerKey, now: Millis, delay: Millis) {
        self.deadlines.insert(key, now.saturating_add(delay));
    }

    /// Schedule `key` unless it is already pending.
    pub fn schedule_once(&mut self, key: TimerKey, now: Millis, delay: Millis) {
        self.deadlines
            .entry(key)
            .or_insert_with(|| now.saturating_add(delay));
    }

    /// Returns whether the key was pending.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    #[must_use]
    pub fn is_pending(&self, key: &TimerKey) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Millis> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key due at `now`, earliest first.
    pub fn take_due(&mut self, now: Millis) -> Vec<TimerKey> {
        let mut due: Vec<(Millis, TimerKey)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, k.clone()))
            .collect();
        due.sort_by_key(|(at, _)| *at);
        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, k)| k).collect()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reschedule_pushes_deadline() {
        let mut timers = Timers::new();
        timers.schedule(TimerKey::Layout, 0, 150);
        timers.schedule(TimerKey::Layout, 100, 150);
        assert!(timers.take_due(200).is_empty());
        assert_eq!(timers.take_due(250), vec![TimerKey::Layout]);
    }

    #[test]
    fn test_schedule_once_keeps_first() {
        let mut timers = Timers::new();
        timers.schedule_once(TimerKey::OutputFlush, 0, 33);
        timers.schedule_once(TimerKey::OutputFlush, 20, 33);
        assert_eq!(timers.next_deadline(), Some(33));
    }

    #[test]
    fn test_due_in_deadline_order() {
        let mut timers = Timers::new();
        timers.schedule(TimerKey::EdgePulse("e".into()), 0, 1500);
        timers.schedule(TimerKey::OutputFlush, 0, 33);
        assert!(timers.cancel(&TimerKey::OutputFlush));
        assert!(!timers.cancel(&TimerKey::OutputFlush));
        timers.schedule(TimerKey::OutputFlush, 0, 33);
        assert_eq!(
            timers.take_due(2000),
            vec![TimerKey::OutputFlush, TimerKey::EdgePulse("e".into())]
        );
        assert_eq!(timers.next_deadline(), None);
    }
}
