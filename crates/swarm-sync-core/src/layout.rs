//! Layout scheduling.
//!
//! Layout is the expensive step, so it only re-runs when the node or edge
//! id set changed. Attribute-only batches go straight to the canvas as a
//! patch. Recomputes are debounced and held back while the user is
//! interacting with the canvas.

use std::collections::{HashMap, VecDeque};

use crate::{
    graph::{Direction, Edge, Node, Position},
    store::{ChangeSet, ExecutionStore},
    timer::{Millis, TimerKey, Timers},
    traits::LayoutEngine,
};

/// What the scheduler decided for one batch of changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutDecision {
    /// Nothing changed.
    Idle,
    /// Attribute-only changes; emit a snapshot without re-layout.
    Patch,
    /// Layout will run when the debounce timer fires.
    Scheduled,
    /// Layout is held until canvas interaction ends.
    Deferred,
}

#[derive(Debug)]
pub struct LayoutScheduler {
    debounce_ms: Millis,
    direction: Direction,
    interacting: bool,
    deferred: bool,
}

impl LayoutScheduler {
    #[must_use]
    pub const fn new(debounce_ms: Millis, direction: Direction) -> Self {
        Self {
            debounce_ms,
            direction,
            interacting: false,
            deferred: false,
        }
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub const fn is_interacting(&self) -> bool {
        self.interacting
    }

    /// Whether a layout is waiting for interaction to end.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Decide how to handle a drained change set.
    pub fn on_changes(&mut self, changes: ChangeSet, timers: &mut Timers, now: Millis) -> LayoutDecision {
        if changes.structural {
            self.request(timers, now)
        } else if changes.attributes {
            LayoutDecision::Patch
        } else {
            LayoutDecision::Idle
        }
    }

    /// Request a layout, debounced.
    pub fn request(&mut self, timers: &mut Timers, now: Millis) -> LayoutDecision {
        if self.interacting {
            self.deferred = true;
            return LayoutDecision::Deferred;
        }
        timers.schedule(TimerKey::Layout, now, self.debounce_ms);
        LayoutDecision::Scheduled
    }

    /// Track canvas interaction (panning, dragging).
    ///
    /// Starting an interaction parks any pending layout; ending it runs a
    /// parked layout once.
    pub fn set_interacting(&mut self, interacting: bool, timers: &mut Timers, now: Millis) {
        if self.interacting == interacting {
            return;
        }
        self.interacting = interacting;
        if interacting {
            if timers.cancel(&TimerKey::Layout) {
                self.deferred = true;
            }
        } else if self.deferred {
            self.deferred = false;
            timers.schedule(TimerKey::Layout, now, self.debounce_ms);
        }
    }

    pub fn set_direction(&mut self, direction: Direction, timers: &mut Timers, now: Millis) -> LayoutDecision {
        if self.direction == direction {
            return LayoutDecision::Idle;
        }
        self.direction = direction;
        self.request(timers, now)
    }

    /// Run the engine and store the positions.
    pub fn run(&self, store: &mut ExecutionStore, engine: &dyn LayoutEngine) {
        let graph = store.graph();
        let positions = engine.layout(graph.nodes(), graph.edges(), self.direction);
        tracing::debug!(nodes = graph.nodes().len(), "layout computed");
        store.apply_positions(&positions);
    }
}

/// Layered layout: each node sits one layer below its deepest BFS parent.
///
/// Nodes only reachable through cycles land in the first layer.
#[derive(Debug, Clone, Copy)]
pub struct LayeredLayout {
    pub node_gap: f64,
    pub layer_gap: f64,
}

impl Default for LayeredLayout {
    fn default() -> Self {
        Self {
            node_gap: 220.0,
            layer_gap: 120.0,
        }
    }
}

impl LayoutEngine for LayeredLayout {
    fn layout(&self, nodes: &[Node], edges: &[Edge], direction: Direction) -> HashMap<String, Position> {
        let mut incoming: HashMap<&str, usize> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in edges {
            if !incoming.contains_key(edge.source.as_str()) {
                continue;
            }
            if let Some(count) = incoming.get_mut(edge.target.as_str()) {
                *count += 1;
                outgoing
                    .entry(edge.source.as_str())
                    .or_default()
                    .push(edge.target.as_str());
            }
        }

        let mut layer: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| incoming.get(id) == Some(&0))
            .collect();
        for &id in &queue {
            layer.insert(id, 0);
        }
        // Kahn's walk: a node is placed once all of its parents are.
        while let Some(id) = queue.pop_front() {
            let depth = layer[id];
            for &next in outgoing.get(id).map(Vec::as_slice).unwrap_or_default() {
                let entry = layer.entry(next).or_insert(0);
                *entry = (*entry).max(depth + 1);
                if let Some(count) = incoming.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        let mut slots: HashMap<usize, usize> = HashMap::new();
        nodes
            .iter()
            .map(|node| {
                let depth = layer.get(node.id.as_str()).copied().unwrap_or(0);
                let slot = slots.entry(depth).or_insert(0);
                let (across, along) = (*slot as f64 * self.node_gap, depth as f64 * self.layer_gap);
                *slot += 1;
                let position = match direction {
                    Direction::TopBottom => Position::new(across, along),
                    Direction::LeftRight => Position::new(along * 2.0, across / 2.0),
                };
                (node.id.clone(), position)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter().map(|id| Node::new(*id, *id)).collect()
    }

    #[test]
    fn test_attribute_changes_skip_layout() {
        let mut scheduler = LayoutScheduler::new(150, Direction::TopBottom);
        let mut timers = Timers::new();
        let decision = scheduler.on_changes(
            ChangeSet { structural: false, attributes: true },
            &mut timers,
            0,
        );
        assert_eq!(decision, LayoutDecision::Patch);
        assert!(!timers.is_pending(&TimerKey::Layout));
    }

    #[test]
    fn test_structural_changes_debounce() {
        let mut scheduler = LayoutScheduler::new(150, Direction::TopBottom);
        let mut timers = Timers::new();
        let structural = ChangeSet { structural: true, attributes: false };
        scheduler.on_changes(structural, &mut timers, 0);
        scheduler.on_changes(structural, &mut timers, 100);
        assert!(timers.take_due(200).is_empty());
        assert_eq!(timers.take_due(250), vec![TimerKey::Layout]);
    }

    #[test]
    fn test_interaction_defers_layout() {
        let mut scheduler = LayoutScheduler::new(150, Direction::TopBottom);
        let mut timers = Timers::new();
        scheduler.request(&mut timers, 0);
        scheduler.set_interacting(true, &mut timers, 10);
        assert!(scheduler.is_deferred());
        assert!(timers.take_due(1_000).is_empty());

        assert_eq!(scheduler.request(&mut timers, 1_000), LayoutDecision::Deferred);
        scheduler.set_interacting(false, &mut timers, 2_000);
        assert!(!scheduler.is_deferred());
        assert_eq!(timers.take_due(2_150), vec![TimerKey::Layout]);
    }

    #[test]
    fn test_layered_positions() {
        let edges = vec![
            Edge::between("a", "b"),
            Edge::between("a", "c"),
            Edge::between("b", "d"),
            Edge::between("c", "d"),
        ];
        let positions =
            LayeredLayout::default().layout(&nodes(&["a", "b", "c", "d"]), &edges, Direction::TopBottom);
        assert_eq!(positions["a"], Position::new(0.0, 0.0));
        assert_eq!(positions["b"].y, 120.0);
        assert_eq!(positions["c"], Position::new(220.0, 120.0));
        assert_eq!(positions["d"].y, 240.0);
    }

    #[test]
    fn test_layered_handles_cycles() {
        let edges = vec![Edge::between("a", "b"), Edge::between("b", "a")];
        let positions = LayeredLayout::default().layout(&nodes(&["a", "b"]), &edges, Direction::LeftRight);
        assert_eq!(positions.len(), 2);
    }
}
