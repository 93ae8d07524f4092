//! Control event interpreter.
//!
//! Each event kind maps to one handler that mutates the store. Handlers
//! never fail: an event naming an unknown agent, node, or edge is a no-op,
//! because backend and client state can legitimately race. Side effects the
//! store cannot perform itself (timers, prompts, resets of sibling
//! components) are returned as [`Effect`]s.

use crate::{
    agent::AgentStatus,
    frame::{
        AgentStarted, ControlEvent, ControlFrame, EdgeFired, HumanPrompt, ParallelChildCompleted,
        ParallelStart, StateExited,
    },
    graph::{ChildResult, ParallelState},
    store::ExecutionStore,
    traits::{PromptKind, PromptRequest},
};

/// Follow-up work requested by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Raise a modal prompt for the UI.
    Prompt(PromptRequest),
    /// Set these edges active now and clear them after the pulse timeout.
    PulseEdges(Vec<String>),
    /// The store was cleared for a new run.
    FullReset,
    /// Runtime state was cleared for a rerun; structure kept.
    SoftReset,
    /// The job is no longer running.
    SessionEnded,
    /// Execution-level failure to show the user.
    ExecutionFailed(String),
}

/// Dispatch one control frame.
pub fn interpret(store: &mut ExecutionStore, frame: &ControlFrame) -> Vec<Effect> {
    let agent = frame.subject();
    let ts = frame.ts;

    match &frame.event {
        ControlEvent::ExecutionStarted(_) => {
            store.clear();
            vec![Effect::FullReset]
        }
        ControlEvent::AgentStarted(p) | ControlEvent::StateEntered(p) => {
            on_entered(store, agent, ts, p);
            Vec::new()
        }
        ControlEvent::StateExited(p) => {
            on_exited(store, agent, ts, p);
            Vec::new()
        }
        ControlEvent::AgentCompleted(p) => {
            if let Some(id) = agent {
                let output = p.output.clone();
                store.update_agent(id, |a| {
                    let mut changed = a.finish(AgentStatus::Completed, ts);
                    if let Some(output) = output {
                        if a.output.is_empty() {
                            a.output = output;
                            changed = true;
                        }
                    }
                    changed
                });
            }
            Vec::new()
        }
        ControlEvent::AgentPaused(_) => {
            if let Some(id) = agent {
                store.update_agent(id, |a| a.transition(AgentStatus::Paused));
            }
            Vec::new()
        }
        ControlEvent::AgentResumed(_) => {
            if let Some(id) = agent {
                store.update_agent(id, |a| a.transition(AgentStatus::Running));
            }
            Vec::new()
        }
        ControlEvent::Error(p) => {
            if let Some(id) = agent {
                let message = p.message.clone();
                store.update_agent(id, |a| {
                    if !a.finish(AgentStatus::Failed, ts) {
                        return false;
                    }
                    a.error = Some(message);
                    true
                });
                Vec::new()
            } else {
                tracing::warn!(exec = %store.exec_id(), "execution error: {}", p.message);
                store.set_execution_error(p.message.clone());
                vec![Effect::ExecutionFailed(p.message.clone())]
            }
        }
        ControlEvent::ToolUse(p) => {
            if let Some(id) = agent {
                let tool = p.tool.clone();
                let action = p.action.clone().unwrap_or_else(|| format!("Using {tool}"));
                store.update_agent(id, |a| {
                    if a.status.is_terminal() {
                        return false;
                    }
                    let added = !tool.is_empty() && a.record_tool(&tool);
                    let relabeled = a.current_action.as_deref() != Some(action.as_str());
                    a.current_action = Some(action);
                    added || relabeled
                });
            }
            Vec::new()
        }
        ControlEvent::ParallelStart(p) => on_parallel_start(store, agent, ts, p),
        ControlEvent::ParallelChildCompleted(p) => {
            on_parallel_child(store, agent, ts, p);
            Vec::new()
        }
        ControlEvent::ParallelAggregated(p) => {
            if let Some(id) = agent {
                let next = p.next_event.clone();
                store.update_node_data(id, |node| {
                    if let Some(parallel) = node.parallel.as_mut() {
                        parallel.running = false;
                    }
                    node.next_event = next;
                    true
                });
            }
            Vec::new()
        }
        ControlEvent::GraphUpdated(p) | ControlEvent::StateMachineCreated(p) => {
            store.enter_state_machine_mode();
            store.merge_graph(p);
            Vec::new()
        }
        ControlEvent::DagStructure(p) => {
            store.append_subgraph(p);
            Vec::new()
        }
        ControlEvent::EdgeFired(p) => on_edge_fired(store, p),
        ControlEvent::HumanDecisionRequired(p) => on_prompt(store, agent, PromptKind::Decision, p),
        ControlEvent::HumanInputRequired(p) => on_prompt(store, agent, PromptKind::Input, p),
        ControlEvent::RerunStarted(_) => {
            store.soft_reset();
            vec![Effect::SoftReset]
        }
        ControlEvent::SessionEnd(_) => {
            store.set_running(false);
            vec![Effect::SessionEnded]
        }
        ControlEvent::Pong(_) => Vec::new(),
    }
}

fn on_entered(store: &mut ExecutionStore, agent: Option<&str>, ts: i64, p: &AgentStarted) {
    let Some(id) = agent else {
        tracing::debug!("entry event without agent id ignored");
        return;
    };
    store.enter_agent(id, ts, p.name.as_deref(), p.parent.as_deref(), p.depth);
}

fn on_exited(store: &mut ExecutionStore, agent: Option<&str>, ts: i64, p: &StateExited) {
    let Some(id) = agent else {
        return;
    };
    let result = p.result.clone();
    store.update_agent(id, |a| {
        let finished = a.finish(AgentStatus::Completed, ts);
        if finished {
            a.result = result;
        }
        finished
    });
    if let Some(next) = &p.next_event {
        let next = next.clone();
        store.update_node_data(id, |node| {
            node.next_event = Some(next);
            true
        });
    }
}

fn on_parallel_start(
    store: &mut ExecutionStore,
    agent: Option<&str>,
    ts: i64,
    p: &ParallelStart,
) -> Vec<Effect> {
    let Some(id) = agent else {
        return Vec::new();
    };
    let children = p.children.clone();
    let updated = store.update_node_data(id, |node| {
        if node.parallel.as_ref().is_some_and(|p| p.started_at >= ts) {
            return false;
        }
        node.parallel = Some(ParallelState {
            running: true,
            children,
            started_at: ts,
            completed: 0,
            child_results: Vec::new(),
        });
        true
    });
    if !updated {
        return Vec::new();
    }
    let edges = store.edges_from(&p.children);
    if edges.is_empty() {
        Vec::new()
    } else {
        vec![Effect::PulseEdges(edges)]
    }
}

fn on_parallel_child(store: &mut ExecutionStore, agent: Option<&str>, ts: i64, p: &ParallelChildCompleted) {
    let Some(id) = agent else {
        return;
    };
    let child = p.child.clone();
    let event = p.event.clone();
    store.update_node_data(id, |node| {
        let Some(parallel) = node.parallel.as_mut() else {
            return false;
        };
        if parallel.child_results.iter().any(|r| r.child == child) {
            return false;
        }
        parallel.completed += 1;
        parallel.child_results.push(ChildResult {
            duration_ms: (ts - parallel.started_at).max(0),
            child,
            event,
        });
        true
    });
}

fn on_edge_fired(store: &mut ExecutionStore, p: &EdgeFired) -> Vec<Effect> {
    let Some(id) = p.resolve_id() else {
        return Vec::new();
    };
    let known = store.update_edge(&id, |edge| {
        let changed = !edge.data.completed;
        edge.data.completed = true;
        changed
    });
    if known || store.graph().contains_edge(&id) {
        vec![Effect::PulseEdges(vec![id])]
    } else {
        Vec::new()
    }
}

fn on_prompt(store: &mut ExecutionStore, agent: Option<&str>, kind: PromptKind, p: &HumanPrompt) -> Vec<Effect> {
    let Some(id) = agent else {
        tracing::debug!("prompt without state id ignored");
        return Vec::new();
    };
    store.update_agent(id, |a| a.transition(AgentStatus::NeedsInput));
    vec![Effect::Prompt(PromptRequest {
        kind,
        state_id: id.to_string(),
        prompt: p.prompt.clone(),
        options: p.options.clone(),
        schema: p.schema.clone(),
    })]
}
