use std::sync::Arc;

use serde_json::{Value, json};
use swarm_sync_core::{
    AgentStatus, CanvasEvent, ExecutionSync, Frame, LayeredLayout, SyncConfig, store::StoreSnapshot,
};

fn new_sync() -> ExecutionSync {
    ExecutionSync::new("exec_1", SyncConfig::default(), Arc::new(LayeredLayout::default()))
}

fn control(kind: &str, agent: Option<&str>, ts: i64, payload: Value) -> Frame {
    let mut value = json!({"type": kind, "exec_id": "exec_1", "ts": ts, "payload": payload});
    if let Some(agent) = agent {
        value["agent_id"] = json!(agent);
    }
    Frame::from_value(value).unwrap()
}

fn token(agent: &str, seq: u64, text: &str) -> Frame {
    Frame::from_value(json!({"exec_id": "exec_1", "agent_id": agent, "seq": seq, "text": text})).unwrap()
}

fn feed(sync: &mut ExecutionSync, frames: &[Frame]) {
    for (i, frame) in frames.iter().enumerate() {
        sync.handle_frame(frame, i as u64);
    }
    sync.flush_output();
}

fn settled(sync: &ExecutionSync) -> StoreSnapshot {
    sync.store().snapshot()
}

fn scenario_frames() -> Vec<Frame> {
    vec![
        control("agent_started", Some("root"), 1_000, json!({})),
        control("state_entered", Some("root"), 1_010, json!({})),
        control("tool_use", Some("root"), 1_020, json!({"tool": "search"})),
        control("agent_started", Some("child1"), 1_030, json!({"parent": "root"})),
        token("child1", 0, "Looking "),
        token("child1", 1, "around"),
        control("state_exited", Some("root"), 1_040, json!({})),
        control("agent_started", Some("child2"), 1_050, json!({"parent": "root"})),
        token("child2", 0, "Found it"),
        control("state_exited", Some("child1"), 1_060, json!({})),
        control("state_exited", Some("child2"), 1_070, json!({})),
        control("session_end", None, 1_080, json!({})),
    ]
}

#[test]
fn test_tree_scenario() {
    let mut sync = new_sync();
    feed(&mut sync, &scenario_frames());
    let store = sync.store();

    for id in ["root", "child1", "child2"] {
        assert_eq!(store.agent(id).unwrap().status, AgentStatus::Completed, "{id}");
    }
    assert!(store.graph().contains_edge("root->child1"));
    assert!(store.graph().contains_edge("root->child2"));
    assert_eq!(store.graph().edges().len(), 2);
    assert_eq!(store.trace(), ["root", "child1", "child2"]);
    assert_eq!(store.agent("root").unwrap().tools_used, vec!["search".to_string()]);
    assert_eq!(store.agent("child1").unwrap().output, "Looking around");
    assert_eq!(store.agent("child1").unwrap().duration_ms, Some(30));
    assert!(!sync.is_running());
}

#[test]
fn test_duplicate_token_applies_once() {
    let mut sync = new_sync();
    feed(&mut sync, &[control("agent_started", Some("a"), 0, json!({})), token("a", 0, "hi")]);
    let once = settled(&sync);

    feed(&mut sync, &[token("a", 0, "hi")]);
    assert_eq!(settled(&sync), once);
    assert_eq!(sync.store().agent("a").unwrap().output, "hi");
}

#[test]
fn test_out_of_order_tokens_drop_stale() {
    let start = control("agent_started", Some("a"), 0, json!({}));

    let mut shuffled = new_sync();
    feed(
        &mut shuffled,
        &[start.clone(), token("a", 0, "zero "), token("a", 2, "two"), token("a", 1, "one ")],
    );

    let mut expected = new_sync();
    feed(&mut expected, &[start, token("a", 0, "zero "), token("a", 2, "two")]);

    assert_eq!(shuffled.store().agent("a").unwrap().output, "zero two");
    assert_eq!(settled(&shuffled), settled(&expected));
}

#[test]
fn test_graph_merge_keeps_unnamed_attributes() {
    let mut sync = new_sync();
    feed(
        &mut sync,
        &[
            control(
                "state_machine_created",
                None,
                0,
                json!({
                    "nodes": [
                        {"id": "plan", "label": "Plan", "data": {"kind": "llm", "model": "m1"}},
                        {"id": "act", "label": "Act", "data": {"kind": "tool"}}
                    ],
                    "edges": [{"source": "plan", "target": "act", "label": "done"}]
                }),
            ),
            control("state_entered", Some("plan"), 10, json!({})),
            control("state_exited", Some("plan"), 20, json!({"next_event": "done"})),
        ],
    );
    let before = settled(&sync);

    feed(
        &mut sync,
        &[control(
            "graph_updated",
            None,
            30,
            json!({"nodes": [{"id": "plan", "data": {"model": "m2"}}]}),
        )],
    );
    let after = settled(&sync);

    let plan = sync.store().graph().node("plan").unwrap();
    assert_eq!(plan.data.extra["model"], json!("m2"));
    assert_eq!(plan.data.extra["kind"], json!("llm"));
    assert_eq!(plan.data.label, "Plan");
    assert_eq!(plan.data.status, AgentStatus::Completed);
    assert_eq!(plan.data.next_event.as_deref(), Some("done"));

    assert_eq!(before.agents, after.agents);
    assert_eq!(before.edges, after.edges);
    assert_eq!(before.nodes[1], after.nodes[1]);
}

#[test]
fn test_resumed_stream_matches_uninterrupted() {
    let frames = scenario_frames();

    let mut uninterrupted = new_sync();
    feed(&mut uninterrupted, &frames);

    // Drop the connection after the first five frames, then resume. The
    // backend re-sends tokens the client already applied.
    let cut = 5;
    let mut resumed = new_sync();
    feed(&mut resumed, &frames[..cut]);
    let mut backlog = vec![token("child1", 0, "Looking ")];
    backlog.extend_from_slice(&frames[cut..]);
    feed(&mut resumed, &backlog);

    assert_eq!(settled(&resumed), settled(&uninterrupted));
    assert_eq!(resumed.store().trace(), uninterrupted.store().trace());
}

#[test]
fn test_full_backlog_replay_matches_uninterrupted() {
    let frames = scenario_frames();

    let mut uninterrupted = new_sync();
    feed(&mut uninterrupted, &frames);

    // Resuming from the beginning re-sends control frames already applied.
    let mut replayed = new_sync();
    feed(&mut replayed, &frames[..7]);
    feed(&mut replayed, &frames);

    assert_eq!(settled(&replayed), settled(&uninterrupted));
    assert_eq!(replayed.store().trace(), uninterrupted.store().trace());
    assert_eq!(replayed.store().agent("root").unwrap().status, AgentStatus::Completed);
}

#[test]
fn test_state_machine_replay_is_idempotent() {
    let frames = vec![
        control(
            "state_machine_created",
            None,
            0,
            json!({
                "nodes": [{"id": "plan", "label": "Plan"}, {"id": "act", "label": "Act"}],
                "edges": [{"source": "plan", "target": "act", "label": "done"}]
            }),
        ),
        control("state_entered", Some("plan"), 10, json!({})),
        control("tool_use", Some("plan"), 15, json!({"tool": "search"})),
        control("state_exited", Some("plan"), 20, json!({"next_event": "done"})),
        control("edge_fired", None, 21, json!({"source": "plan", "target": "act"})),
        control("state_entered", Some("act"), 30, json!({})),
        control("graph_updated", None, 35, json!({"nodes": [{"id": "plan", "data": {"model": "m2"}}]})),
        control("state_exited", Some("act"), 40, json!({})),
        control("session_end", None, 50, json!({})),
    ];

    let mut uninterrupted = new_sync();
    feed(&mut uninterrupted, &frames);

    let mut replayed = new_sync();
    feed(&mut replayed, &frames[..6]);
    feed(&mut replayed, &frames);

    assert_eq!(settled(&replayed), settled(&uninterrupted));
    assert_eq!(replayed.store().trace(), ["plan", "act"]);
    assert_eq!(replayed.store().agent("plan").unwrap().execution_order, Some(1));
}

#[test]
fn test_undo_after_streaming_keeps_backend_state() {
    let frames = scenario_frames();
    let mut sync = new_sync();
    feed(&mut sync, &frames[..4]);

    let edge = sync.connect_nodes("child1", "root", 100).unwrap();
    feed(&mut sync, &frames[4..]);
    sync.undo(200).unwrap();

    let store = sync.store();
    assert!(!store.graph().contains_edge(&edge));
    assert!(store.graph().contains_edge("root->child1"));
    assert!(store.graph().contains_edge("root->child2"));
    for id in ["root", "child1", "child2"] {
        assert_eq!(store.agent(id).unwrap().status, AgentStatus::Completed, "{id}");
        assert_eq!(store.graph().node(id).unwrap().data.status, AgentStatus::Completed, "{id}");
    }

    // child2 arrived after the edit, so its events still land.
    assert_eq!(store.agent("child2").unwrap().output, "Found it");
}

#[test]
fn test_highlight_covers_connected_path_only() {
    let mut sync = new_sync();
    feed(
        &mut sync,
        &[control(
            "graph_updated",
            None,
            0,
            json!({
                "nodes": [{"id": "A"}, {"id": "B"}, {"id": "C"}, {"id": "D"}],
                "edges": [{"source": "A", "target": "B"}, {"source": "B", "target": "C"}]
            }),
        )],
    );

    sync.highlight_path("B", 10).unwrap();
    let graph = sync.store().graph();
    for id in ["A", "B", "C"] {
        assert!(!graph.node(id).unwrap().data.dimmed, "{id}");
        assert!(graph.node(id).unwrap().data.highlighted, "{id}");
    }
    assert!(graph.node("D").unwrap().data.dimmed);
    assert!(graph.edges().iter().all(|e| !e.data.dimmed));

    sync.clear_highlight(20);
    assert!(sync.store().graph().nodes().iter().all(|n| !n.data.dimmed));
}

#[test]
fn test_rerun_keeps_structure() {
    let mut sync = new_sync();
    let mut frames = scenario_frames();
    frames.push(control("rerun_started", None, 2_000, json!({"from": "root"})));
    frames.push(control("agent_started", Some("root"), 2_010, json!({})));
    frames.push(token("child1", 0, "again"));
    feed(&mut sync, &frames);

    let store = sync.store();
    assert_eq!(store.graph().nodes().len(), 3);
    assert_eq!(store.graph().edges().len(), 2);
    assert_eq!(store.trace(), ["root"]);
    assert_eq!(store.agent("root").unwrap().status, AgentStatus::Running);
    assert_eq!(store.agent("child2").unwrap().status, AgentStatus::Pending);
    assert_eq!(store.agent("child1").unwrap().output, "again");
    assert!(sync.is_running());
}

#[test]
fn test_human_prompt_raises_modal() {
    let mut sync = new_sync();
    feed(
        &mut sync,
        &[
            control("state_entered", Some("review"), 0, json!({})),
            control(
                "human_decision_required",
                Some("review"),
                10,
                json!({"prompt": "Ship it?", "options": ["yes", "no"]}),
            ),
        ],
    );

    assert_eq!(sync.store().agent("review").unwrap().status, AgentStatus::NeedsInput);
    let modal = sync
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            CanvasEvent::Modal(prompt) => Some(prompt),
            _ => None,
        })
        .unwrap();
    assert_eq!(modal.state_id, "review");
    assert_eq!(modal.options, vec!["yes".to_string(), "no".to_string()]);
}
