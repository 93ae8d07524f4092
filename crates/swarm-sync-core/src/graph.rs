//! Node/edge projection of execution state.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::{Agent, AgentStatus};

/// Canvas coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Layout direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Top to bottom.
    #[default]
    #[serde(rename = "TB")]
    TopBottom,
    /// Left to right.
    #[serde(rename = "LR")]
    LeftRight,
}

/// Fan-out bookkeeping for a node running parallel children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelState {
    pub running: bool,
    pub children: Vec<String>,
    pub started_at: i64,
    pub completed: usize,
    pub child_results: Vec<ChildResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildResult {
    pub child: String,
    pub event: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    pub label: String,
    pub status: AgentStatus,
    pub duration: Option<i64>,
    pub tools_used: Vec<String>,
    pub highlighted: bool,
    pub dimmed: bool,
    pub execution_order: Option<u64>,
    pub current_action: Option<String>,
    pub parallel: Option<ParallelState>,
    pub next_event: Option<String>,
    /// Open attributes supplied by the backend or by user edits.
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub position: Position,
    pub data: NodeData,
}

impl Node {
    #[must_use]
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position: Position::default(),
            data: NodeData {
                label: label.into(),
                ..NodeData::default()
            },
        }
    }

    /// Copy the runtime attributes of an agent onto this node.
    ///
    /// Returns whether anything changed.
    pub fn sync_from(&mut self, agent: &Agent) -> bool {
        let data = &mut self.data;
        let changed = data.status != agent.status
            || data.duration != agent.duration_ms
            || data.execution_order != agent.execution_order
            || data.current_action != agent.current_action
            || data.tools_used != agent.tools_used;
        if changed {
            data.status = agent.status;
            data.duration = agent.duration_ms;
            data.execution_order = agent.execution_order;
            data.current_action.clone_from(&agent.current_action);
            data.tools_used.clone_from(&agent.tools_used);
        }
        changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeData {
    pub label: Option<String>,
    pub active: bool,
    pub completed: bool,
    pub dimmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub data: EdgeData,
}

impl Edge {
    #[must_use]
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            data: EdgeData::default(),
        }
    }

    /// Edge with the conventional `source->target` id.
    #[must_use]
    pub fn between(source: &str, target: &str) -> Self {
        Self::new(format!("{source}->{target}"), source, target)
    }
}

/// `{nodes, edges}` pair handed to the canvas and kept in history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Ordered node/edge collections with id lookup.
///
/// Every id is stamped from a monotonic clock the first time it is added.
/// Stamps outlive removal, so a [`Graph::mark`] taken earlier tells which
/// ids are newer than it.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    node_index: HashMap<String, usize>,
    edge_index: HashMap<String, usize>,
    clock: u64,
    node_born: HashMap<String, u64>,
    edge_born: HashMap<String, u64>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.node_index.get(id).map(|&i| &mut self.nodes[i])
    }

    #[must_use]
    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edge_index.get(id).map(|&i| &self.edges[i])
    }

    pub fn edge_mut(&mut self, id: &str) -> Option<&mut Edge> {
        self.edge_index.get(id).map(|&i| &mut self.edges[i])
    }

    #[must_use]
    pub fn contains_node(&self, id: &str) -> bool {
        self.node_index.contains_key(id)
    }

    #[must_use]
    pub fn contains_edge(&self, id: &str) -> bool {
        self.edge_index.contains_key(id)
    }

    pub fn edges_mut(&mut self) -> impl Iterator<Item = &mut Edge> {
        self.edges.iter_mut()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    /// Insert a node unless its id is taken. Returns whether it was added.
    pub fn add_node(&mut self, node: Node) -> bool {
        if self.node_index.contains_key(&node.id) {
            return false;
        }
        stamp(&mut self.node_born, &mut self.clock, &node.id);
        self.node_index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        true
    }

    /// Insert an edge unless its id is taken. Returns whether it was added.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if self.edge_index.contains_key(&edge.id) {
            return false;
        }
        stamp(&mut self.edge_born, &mut self.clock, &edge.id);
        self.edge_index.insert(edge.id.clone(), self.edges.len());
        self.edges.push(edge);
        true
    }

    /// Current stamp clock.
    #[must_use]
    pub const fn mark(&self) -> u64 {
        self.clock
    }

    /// Whether the node id was first added after `mark`.
    #[must_use]
    pub fn node_born_after(&self, id: &str, mark: u64) -> bool {
        self.node_born.get(id).is_some_and(|&t| t > mark)
    }

    /// Whether the edge id was first added after `mark`.
    #[must_use]
    pub fn edge_born_after(&self, id: &str, mark: u64) -> bool {
        self.edge_born.get(id).is_some_and(|&t| t > mark)
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let idx = self.node_index.get(id).copied()?;
        let node = self.nodes.remove(idx);
        self.edges.retain(|e| e.source != id && e.target != id);
        self.reindex();
        Some(node)
    }

    pub fn remove_edge(&mut self, id: &str) -> Option<Edge> {
        let idx = self.edge_index.get(id).copied()?;
        let edge = self.edges.remove(idx);
        self.reindex();
        Some(edge)
    }

    /// Remove everything, stamps included. The clock keeps counting.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.node_index.clear();
        self.edge_index.clear();
        self.node_born.clear();
        self.edge_born.clear();
    }

    /// Replace the whole graph. Stamps are kept.
    pub fn replace(&mut self, snapshot: GraphSnapshot) {
        for node in &snapshot.nodes {
            stamp(&mut self.node_born, &mut self.clock, &node.id);
        }
        for edge in &snapshot.edges {
            stamp(&mut self.edge_born, &mut self.clock, &edge.id);
        }
        self.nodes = snapshot.nodes;
        self.edges = snapshot.edges;
        self.reindex();
    }

    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    fn reindex(&mut self) {
        self.node_index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        self.edge_index = self
            .edges
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
    }
}

fn stamp(born: &mut HashMap<String, u64>, clock: &mut u64, id: &str) {
    if !born.contains_key(id) {
        *clock += 1;
        born.insert(id.to_string(), *clock);
    }
}

/// Nodes and edges on some path through a selected node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    pub nodes: HashSet<String>,
    pub edges: HashSet<String>,
}

/// Collect every node reachable forward or backward from `selected`.
///
/// Each direction runs at most `max_rounds` BFS rounds.
#[must_use]
pub fn connected_path(edges: &[Edge], selected: &str, max_rounds: usize) -> PathSet {
    let mut path = PathSet::default();
    path.nodes.insert(selected.to_string());

    for forward in [true, false] {
        let mut seen: HashSet<&str> = HashSet::from([selected]);
        let mut frontier: VecDeque<&str> = VecDeque::from([selected]);
        let mut rounds = 0;

        while !frontier.is_empty() && rounds < max_rounds {
            rounds += 1;
            let mut next = VecDeque::new();
            for current in frontier.drain(..) {
                for edge in edges {
                    let (from, to) = if forward {
                        (edge.source.as_str(), edge.target.as_str())
                    } else {
                        (edge.target.as_str(), edge.source.as_str())
                    };
                    if from != current {
                        continue;
                    }
                    path.edges.insert(edge.id.clone());
                    if seen.insert(to) {
                        path.nodes.insert(to.to_string());
                        next.push_back(to);
                    }
                }
            }
            frontier = next;
        }
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Vec<Edge> {
        vec![Edge::between("A", "B"), Edge::between("B", "C")]
    }

    #[test]
    fn test_stamps_survive_removal() {
        let mut graph = Graph::new();
        graph.add_node(Node::new("a", "a"));
        let mark = graph.mark();
        graph.add_node(Node::new("b", "b"));
        graph.add_edge(Edge::between("a", "b"));
        assert!(!graph.node_born_after("a", mark));
        assert!(graph.node_born_after("b", mark));
        assert!(graph.edge_born_after("a->b", mark));

        graph.remove_node("a");
        graph.add_node(Node::new("a", "a"));
        assert!(!graph.node_born_after("a", mark));
        assert!(!graph.node_born_after("missing", mark));
    }

    #[test]
    fn test_path_through_middle() {
        let path = connected_path(&chain(), "B", 100);
        let expected: HashSet<String> = ["A", "B", "C"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(path.nodes, expected);
        assert_eq!(path.edges.len(), 2);
    }

    #[test]
    fn test_path_survives_cycle() {
        let edges = vec![
            Edge::between("A", "B"),
            Edge::between("B", "A"),
            Edge::between("B", "C"),
        ];
        let path = connected_path(&edges, "A", 100);
        assert!(path.nodes.contains("C"));
        assert_eq!(path.edges.len(), 3);
    }

    #[test]
    fn test_round_guard_limits_depth() {
        let edges = vec![
            Edge::between("A", "B"),
            Edge::between("B", "C"),
            Edge::between("C", "D"),
        ];
        let path = connected_path(&edges, "A", 2);
        assert!(path.nodes.contains("C"));
        assert!(!path.nodes.contains("D"));
    }

    #[test]
    fn test_remove_node_drops_incident_edges() {
        let mut graph = Graph::new();
        for id in ["A", "B", "C"] {
            graph.add_node(Node::new(id, id));
        }
        for edge in chain() {
            graph.add_edge(edge);
        }
        graph.remove_node("B");
        assert!(graph.edges().is_empty());
        assert!(graph.node("C").is_some());
        assert!(!graph.add_node(Node::new("A", "dup")));
    }
}
