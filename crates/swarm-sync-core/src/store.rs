//! Canonical execution state: agents, derived graph, execution trace.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    agent::{Agent, AgentId, AgentStatus},
    error::SyncError,
    frame::{ControlFrame, GraphPayload, Timestamp, TokenFrame},
    graph::{Edge, Graph, GraphSnapshot, Node, NodeData, Position, connected_path},
    history::Checkpoint,
    interpreter::{self, Effect},
    traits::GraphMode,
};

/// Offset applied to a duplicated node.
const DUPLICATE_OFFSET: f64 = 40.0;

/// What kind of mutations happened since the last drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// The node or edge id set changed; positions must be recomputed.
    pub structural: bool,
    /// Fields changed in place; a snapshot is enough.
    pub attributes: bool,
}

impl ChangeSet {
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.structural && !self.attributes
    }
}

/// Read-only copy of the whole store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub agents: Vec<Agent>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// State for one execution id.
///
/// Owned by exactly one synchronizer; never shared.
#[derive(Debug)]
pub struct ExecutionStore {
    exec_id: String,
    agents: HashMap<AgentId, Agent>,
    /// Agent ids in creation order.
    agent_order: Vec<AgentId>,
    graph: Graph,
    mode: GraphMode,
    trace: Vec<AgentId>,
    current: Option<AgentId>,
    order_counter: u64,
    running: bool,
    execution_error: Option<String>,
    output_limit: usize,
    changes: ChangeSet,
    /// Node and edge ids created by user edits rather than the backend.
    user_nodes: HashSet<String>,
    user_edges: HashSet<String>,
    /// Agents removed by user deletes, kept so undo can bring them back.
    removed: HashMap<AgentId, Agent>,
}

impl ExecutionStore {
    #[must_use]
    pub fn new(exec_id: impl Into<String>, output_limit: usize) -> Self {
        Self {
            exec_id: exec_id.into(),
            agents: HashMap::new(),
            agent_order: Vec::new(),
            graph: Graph::new(),
            mode: GraphMode::Tree,
            trace: Vec::new(),
            current: None,
            order_counter: 0,
            running: true,
            execution_error: None,
            output_limit,
            changes: ChangeSet::default(),
            user_nodes: HashSet::new(),
            user_edges: HashSet::new(),
            removed: HashMap::new(),
        }
    }

    #[must_use]
    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    #[must_use]
    pub const fn mode(&self) -> GraphMode {
        self.mode
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    pub const fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    #[must_use]
    pub fn execution_error(&self) -> Option<&str> {
        self.execution_error.as_deref()
    }

    pub fn set_execution_error(&mut self, message: String) {
        self.execution_error = Some(message);
        self.running = false;
    }

    #[must_use]
    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Agents in creation order.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agent_order.iter().filter_map(|id| self.agents.get(id))
    }

    #[must_use]
    pub fn trace(&self) -> &[AgentId] {
        &self.trace
    }

    /// Agent entered most recently.
    #[must_use]
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    #[must_use]
    pub const fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Drain the accumulated change classification.
    pub fn take_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }

    pub(crate) const fn mark_structural(&mut self) {
        self.changes.structural = true;
    }

    pub(crate) const fn mark_attributes(&mut self) {
        self.changes.attributes = true;
    }

    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            agents: self.agents().cloned().collect(),
            nodes: self.graph.nodes().to_vec(),
            edges: self.graph.edges().to_vec(),
        }
    }

    #[must_use]
    pub fn graph_snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// Apply an admitted token frame.
    ///
    /// Non-final text is appended; a final frame closes the agent's stream
    /// and leaves its output untouched. Unknown agents are ignored.
    pub fn apply_token(&mut self, frame: &TokenFrame) -> bool {
        if frame.is_final {
            return self.update_agent(&frame.agent_id, |agent| {
                let changed = !agent.stream_closed;
                agent.stream_closed = true;
                changed
            });
        }
        self.append_output(&frame.agent_id, &frame.text)
    }

    /// Append text to an agent's visible output.
    pub fn append_output(&mut self, agent_id: &str, text: &str) -> bool {
        let limit = self.output_limit;
        self.update_agent(agent_id, |agent| {
            if text.is_empty() {
                return false;
            }
            agent.append_output(text, limit);
            true
        })
    }

    /// Apply a control frame through the interpreter.
    pub fn apply_control(&mut self, frame: &ControlFrame) -> Vec<Effect> {
        interpreter::interpret(self, frame)
    }

    /// Mutate a known agent and project the result onto its node.
    ///
    /// Returns `false` for unknown agents or when `f` reports no change.
    pub fn update_agent(&mut self, id: &str, f: impl FnOnce(&mut Agent) -> bool) -> bool {
        let Some(agent) = self.agents.get_mut(id) else {
            tracing::debug!(exec = %self.exec_id, agent = id, "event for unknown agent ignored");
            return false;
        };
        if !f(agent) {
            return false;
        }
        self.sync_node(id);
        self.mark_attributes();
        true
    }

    /// Mutate a node in place. Returns `false` for unknown nodes.
    pub fn update_node_data(&mut self, id: &str, f: impl FnOnce(&mut NodeData) -> bool) -> bool {
        let Some(node) = self.graph.node_mut(id) else {
            tracing::debug!(exec = %self.exec_id, node = id, "event for unknown node ignored");
            return false;
        };
        if !f(&mut node.data) {
            return false;
        }
        self.mark_attributes();
        true
    }

    /// Mutate an edge in place. Returns `false` for unknown edges.
    pub fn update_edge(&mut self, id: &str, f: impl FnOnce(&mut Edge) -> bool) -> bool {
        let Some(edge) = self.graph.edge_mut(id) else {
            tracing::debug!(exec = %self.exec_id, edge = id, "event for unknown edge ignored");
            return false;
        };
        if !f(edge) {
            return false;
        }
        self.mark_attributes();
        true
    }

    fn sync_node(&mut self, id: &str) {
        if let (Some(agent), Some(node)) = (self.agents.get(id), self.graph.node_mut(id)) {
            node.sync_from(agent);
        }
    }

    /// Create a pending agent and its node if absent.
    ///
    /// Returns whether the agent was created.
    pub fn ensure_agent(&mut self, id: &str, label: Option<&str>) -> bool {
        if self.agents.contains_key(id) {
            return false;
        }
        let mut agent = Agent::new(id);
        if let Some(label) = label {
            agent.name = label.to_string();
        }
        let node = Node::new(id, agent.name.clone());
        self.agents.insert(id.to_string(), agent);
        self.agent_order.push(id.to_string());
        self.graph.add_node(node);
        self.mark_structural();
        true
    }

    /// Start a new activation of an agent, creating it if needed.
    ///
    /// An entry not newer than the agent's last recorded start or end is a
    /// replay of one already applied and is ignored.
    pub fn enter_agent(
        &mut self,
        id: &str,
        ts: Timestamp,
        name: Option<&str>,
        parent: Option<&str>,
        depth: Option<u32>,
    ) {
        if let Some(agent) = self.agents.get(id) {
            let latest = agent.start_time.max(agent.end_time);
            if latest.is_some_and(|t| ts <= t) {
                tracing::debug!(exec = %self.exec_id, agent = id, ts, "replayed entry ignored");
                return;
            }
        }
        self.ensure_agent(id, name);
        self.order_counter += 1;
        let order = self.order_counter;

        let parent_depth = parent
            .and_then(|p| self.agents.get(p))
            .map(|p| p.depth + 1);
        if let Some(agent) = self.agents.get_mut(id) {
            if let Some(name) = name {
                agent.name = name.to_string();
            }
            if let Some(parent) = parent {
                agent.parent = Some(parent.to_string());
            }
            agent.depth = depth.or(parent_depth).unwrap_or(agent.depth);
            agent.activate(ts, order);
        }
        if let Some(name) = name {
            if let Some(node) = self.graph.node_mut(id) {
                node.data.label = name.to_string();
            }
        }
        self.sync_node(id);
        self.mark_attributes();

        if self.trace.last().map(String::as_str) != Some(id) {
            self.trace.push(id.to_string());
        }
        self.current = Some(id.to_string());
        self.connect_tree_edges();
    }

    /// In tree mode, add `parent -> child` edges for every agent whose
    /// parent is present and not yet connected.
    pub fn connect_tree_edges(&mut self) {
        if self.mode != GraphMode::Tree {
            return;
        }
        let missing: Vec<Edge> = self
            .agent_order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .filter_map(|agent| {
                let parent = agent.parent.as_deref()?;
                if !self.graph.contains_node(parent) || !self.graph.contains_node(&agent.id) {
                    return None;
                }
                let edge = Edge::between(parent, &agent.id);
                (!self.graph.contains_edge(&edge.id)).then_some(edge)
            })
            .collect();
        if missing.is_empty() {
            return;
        }
        for edge in missing {
            self.graph.add_edge(edge);
        }
        self.mark_structural();
    }

    /// Switch to state-machine mode, dropping tree-derived edges.
    pub fn enter_state_machine_mode(&mut self) {
        if self.mode == GraphMode::StateMachine {
            return;
        }
        self.mode = GraphMode::StateMachine;
        let tree_edges: Vec<String> = self
            .agents
            .values()
            .filter_map(|a| a.parent.as_deref().map(|p| format!("{p}->{}", a.id)))
            .collect();
        for id in tree_edges {
            if self.graph.remove_edge(&id).is_some() {
                self.mark_structural();
            }
        }
    }

    /// Merge a transition graph in place.
    ///
    /// Existing nodes keep their runtime data and only take attributes the
    /// payload names; new ids are appended. Nothing is removed.
    pub fn merge_graph(&mut self, payload: &GraphPayload) {
        for spec in &payload.nodes {
            if spec.id.is_empty() {
                continue;
            }
            if self.graph.contains_node(&spec.id) {
                let label = spec.label.clone();
                let data = spec.data.clone();
                self.update_node_data(&spec.id, |node| {
                    let mut changed = false;
                    if let Some(label) = label {
                        changed |= node.label != label;
                        node.label = label;
                    }
                    if let Some(patch) = data {
                        changed |= merge_extra(&mut node.extra, &patch);
                    }
                    changed
                });
                if let Some(label) = &spec.label {
                    if let Some(agent) = self.agents.get_mut(&spec.id) {
                        agent.name.clone_from(label);
                    }
                }
            } else {
                self.add_spec_node(spec);
            }
        }
        self.add_spec_edges(payload);
    }

    /// Append a subgraph, skipping every id already present.
    pub fn append_subgraph(&mut self, payload: &GraphPayload) {
        for spec in &payload.nodes {
            if !spec.id.is_empty() && !self.graph.contains_node(&spec.id) {
                self.add_spec_node(spec);
            }
        }
        self.add_spec_edges(payload);
        self.connect_tree_edges();
    }

    fn add_spec_node(&mut self, spec: &crate::frame::NodeSpec) {
        self.ensure_agent(&spec.id, spec.label.as_deref());
        if let Some(parent) = &spec.parent {
            if let Some(agent) = self.agents.get_mut(&spec.id) {
                agent.parent = Some(parent.clone());
            }
        }
        if let (Some(patch), Some(node)) = (&spec.data, self.graph.node_mut(&spec.id)) {
            merge_extra(&mut node.data.extra, patch);
        }
    }

    fn add_spec_edges(&mut self, payload: &GraphPayload) {
        for spec in &payload.edges {
            let id = spec.edge_id();
            if self.graph.contains_edge(&id) {
                let label = spec.label.clone();
                self.update_edge(&id, |edge| {
                    if label.is_none() || edge.data.label == label {
                        return false;
                    }
                    edge.data.label = label;
                    true
                });
                continue;
            }
            if !self.graph.contains_node(&spec.source) || !self.graph.contains_node(&spec.target) {
                tracing::debug!(edge = %id, "edge with unknown endpoint skipped");
                continue;
            }
            let mut edge = Edge::new(id, spec.source.clone(), spec.target.clone());
            edge.data.label.clone_from(&spec.label);
            self.graph.add_edge(edge);
            self.mark_structural();
        }
    }

    /// Ids of edges leaving any of `sources`.
    #[must_use]
    pub fn edges_from(&self, sources: &[String]) -> Vec<String> {
        self.graph
            .edges()
            .iter()
            .filter(|e| sources.contains(&e.source))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Clear runtime state but keep the graph structure (rerun).
    pub fn soft_reset(&mut self) {
        for agent in self.agents.values_mut() {
            agent.reset();
        }
        for node in self.graph.nodes_mut() {
            if let Some(agent) = self.agents.get(&node.id) {
                node.sync_from(agent);
            }
            node.data.parallel = None;
            node.data.next_event = None;
            node.data.highlighted = false;
            node.data.dimmed = false;
        }
        for edge in self.graph.edges_mut() {
            edge.data.active = false;
            edge.data.completed = false;
            edge.data.dimmed = false;
        }
        self.trace.clear();
        self.current = None;
        self.order_counter = 0;
        self.running = true;
        self.execution_error = None;
        self.mark_attributes();
    }

    /// Drop everything (new run).
    pub fn clear(&mut self) {
        self.agents.clear();
        self.agent_order.clear();
        self.graph.clear();
        self.mode = GraphMode::Tree;
        self.trace.clear();
        self.current = None;
        self.order_counter = 0;
        self.running = true;
        self.execution_error = None;
        self.user_nodes.clear();
        self.user_edges.clear();
        self.removed.clear();
        self.mark_structural();
    }

    /// Fail every running agent and mark the job stopped.
    pub fn fail_running(&mut self, ts: Timestamp) {
        let running: Vec<AgentId> = self
            .agents()
            .filter(|a| a.status == AgentStatus::Running)
            .map(|a| a.id.clone())
            .collect();
        for id in running {
            self.update_agent(&id, |agent| agent.finish(AgentStatus::Failed, ts));
        }
        self.running = false;
    }

    /// Store layout output on the nodes.
    pub fn apply_positions(&mut self, positions: &HashMap<String, Position>) {
        for node in self.graph.nodes_mut() {
            if let Some(pos) = positions.get(&node.id) {
                node.position = *pos;
            }
        }
    }

    /// Dim everything off the paths through `selected`.
    ///
    /// # Errors
    /// Returns error if the node does not exist.
    pub fn highlight_path(&mut self, selected: &str, max_rounds: usize) -> Result<(), SyncError> {
        if !self.graph.contains_node(selected) {
            return Err(SyncError::NodeNotFound(selected.to_string()));
        }
        let path = connected_path(self.graph.edges(), selected, max_rounds);
        for node in self.graph.nodes_mut() {
            let on_path = path.nodes.contains(&node.id);
            node.data.highlighted = on_path;
            node.data.dimmed = !on_path;
        }
        for edge in self.graph.edges_mut() {
            edge.data.dimmed = !path.edges.contains(&edge.id);
        }
        self.mark_attributes();
        Ok(())
    }

    pub fn clear_highlight(&mut self) {
        for node in self.graph.nodes_mut() {
            node.data.highlighted = false;
            node.data.dimmed = false;
        }
        for edge in self.graph.edges_mut() {
            edge.data.dimmed = false;
        }
        self.mark_attributes();
    }

    // Command interface for the canvas collaborator.

    /// Apply a JSON merge patch to a node's data.
    ///
    /// # Errors
    /// Returns error if the node is unknown or the patch yields invalid data.
    pub fn update(&mut self, id: &str, patch: &Value) -> Result<(), SyncError> {
        let node = self
            .graph
            .node_mut(id)
            .ok_or_else(|| SyncError::NodeNotFound(id.to_string()))?;
        let mut doc =
            serde_json::to_value(&node.data).map_err(|e| SyncError::InvalidPatch(e.to_string()))?;
        json_patch::merge(&mut doc, patch);
        let data: NodeData =
            serde_json::from_value(doc).map_err(|e| SyncError::InvalidPatch(e.to_string()))?;
        let label = data.label.clone();
        node.data = data;
        if let Some(agent) = self.agents.get_mut(id) {
            agent.name = label;
        }
        self.mark_attributes();
        Ok(())
    }

    /// Remove a node, its incident edges, and its agent.
    ///
    /// # Errors
    /// Returns error if the node is unknown.
    pub fn delete(&mut self, id: &str) -> Result<(), SyncError> {
        self.graph
            .remove_node(id)
            .ok_or_else(|| SyncError::NodeNotFound(id.to_string()))?;
        if let Some(agent) = self.agents.remove(id) {
            self.removed.insert(id.to_string(), agent);
        }
        self.agent_order.retain(|a| a != id);
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        self.mark_structural();
        Ok(())
    }

    /// Copy a node as a fresh pending agent. Returns the new id.
    ///
    /// # Errors
    /// Returns error if the node is unknown.
    pub fn duplicate(&mut self, id: &str) -> Result<String, SyncError> {
        let source = self
            .graph
            .node(id)
            .cloned()
            .ok_or_else(|| SyncError::NodeNotFound(id.to_string()))?;

        let mut new_id = format!("{id}-copy");
        let mut n = 2;
        while self.graph.contains_node(&new_id) || self.agents.contains_key(&new_id) {
            new_id = format!("{id}-copy-{n}");
            n += 1;
        }

        let label = format!("{} (copy)", source.data.label);
        self.ensure_agent(&new_id, Some(&label));
        self.user_nodes.insert(new_id.clone());
        if let Some(parent) = self.agents.get(id).and_then(|a| a.parent.clone()) {
            if let Some(copy) = self.agents.get_mut(&new_id) {
                copy.parent = Some(parent);
            }
        }
        if let Some(node) = self.graph.node_mut(&new_id) {
            node.position = Position::new(
                source.position.x + DUPLICATE_OFFSET,
                source.position.y + DUPLICATE_OFFSET,
            );
            node.data.extra = source.data.extra;
        }
        self.connect_tree_edges();
        Ok(new_id)
    }

    /// Add a user-drawn edge. Returns its id.
    ///
    /// # Errors
    /// Returns error if an endpoint is unknown or the edge exists.
    pub fn connect(&mut self, source: &str, target: &str) -> Result<String, SyncError> {
        for id in [source, target] {
            if !self.graph.contains_node(id) {
                return Err(SyncError::NodeNotFound(id.to_string()));
            }
        }
        let edge = Edge::between(source, target);
        let id = edge.id.clone();
        if !self.graph.add_edge(edge) {
            return Err(SyncError::EdgeExists(id));
        }
        self.user_edges.insert(id.clone());
        self.mark_structural();
        Ok(id)
    }

    /// Remove a user-selected edge.
    ///
    /// # Errors
    /// Returns error if the edge is unknown.
    pub fn disconnect_edge(&mut self, edge_id: &str) -> Result<(), SyncError> {
        self.graph
            .remove_edge(edge_id)
            .ok_or_else(|| SyncError::EdgeNotFound(edge_id.to_string()))?;
        self.mark_structural();
        Ok(())
    }

    /// Record the graph for undo.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            graph: self.graph.snapshot(),
            mark: self.graph.mark(),
        }
    }

    /// Bring back the structure a checkpoint recorded (undo/redo).
    ///
    /// Only the node/edge sets and the user-editable node fields (label,
    /// extra attributes, position) come from the checkpoint. Nodes and edges
    /// the backend added after it stay, live runtime data is kept, and every
    /// node is re-synced from its agent. An agent leaves the store only
    /// together with a node that a user edit removed, and comes back with it.
    pub fn restore(&mut self, checkpoint: &Checkpoint) {
        let mut target = checkpoint.graph.clone();
        for node in &mut target.nodes {
            if let Some(live) = self.graph.node(&node.id) {
                let label = std::mem::take(&mut node.data.label);
                let extra = std::mem::take(&mut node.data.extra);
                node.data = live.data.clone();
                node.data.label = label;
                node.data.extra = extra;
            }
        }
        for edge in &mut target.edges {
            if let Some(live) = self.graph.edge(&edge.id) {
                edge.data = live.data.clone();
            }
        }
        let mut node_ids: HashSet<String> = target.nodes.iter().map(|n| n.id.clone()).collect();
        for node in self.graph.nodes() {
            if !node_ids.contains(&node.id)
                && self.graph.node_born_after(&node.id, checkpoint.mark)
                && !self.user_nodes.contains(&node.id)
            {
                node_ids.insert(node.id.clone());
                target.nodes.push(node.clone());
            }
        }
        let edge_ids: HashSet<String> = target.edges.iter().map(|e| e.id.clone()).collect();
        for edge in self.graph.edges() {
            if !edge_ids.contains(&edge.id)
                && self.graph.edge_born_after(&edge.id, checkpoint.mark)
                && !self.user_edges.contains(&edge.id)
                && node_ids.contains(&edge.source)
                && node_ids.contains(&edge.target)
            {
                target.edges.push(edge.clone());
            }
        }

        let gone: Vec<AgentId> = self
            .agent_order
            .iter()
            .filter(|id| !node_ids.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(agent) = self.agents.remove(&id) {
                self.removed.insert(id, agent);
            }
        }
        self.agent_order.retain(|id| node_ids.contains(id));
        for node in &target.nodes {
            if self.agents.contains_key(&node.id) {
                continue;
            }
            let agent = self
                .removed
                .remove(&node.id)
                .unwrap_or_else(|| Agent::new(node.id.clone()));
            self.agents.insert(node.id.clone(), agent);
            self.agent_order.push(node.id.clone());
        }

        self.graph.replace(target);
        for node in self.graph.nodes_mut() {
            if let Some(agent) = self.agents.get_mut(&node.id) {
                agent.name.clone_from(&node.data.label);
                node.sync_from(agent);
            }
        }
        if self
            .current
            .as_ref()
            .is_some_and(|id| !self.agents.contains_key(id))
        {
            self.current = None;
        }
        self.mark_structural();
    }
}

/// JSON merge patch over an open attribute map. Returns whether it changed.
fn merge_extra(extra: &mut serde_json::Map<String, Value>, patch: &Value) -> bool {
    let mut doc = Value::Object(std::mem::take(extra));
    let before = doc.clone();
    json_patch::merge(&mut doc, patch);
    let changed = doc != before;
    if let Value::Object(map) = doc {
        *extra = map;
    }
    changed
}
