//! The execution-state synchronizer.
//!
//! One [`ExecutionSync`] owns all state for one execution id: sequencer,
//! store, output coalescer, layout scheduler, history, and replay cursor.
//! It is driven synchronously: the caller feeds frames and clock ticks and
//! drains the resulting canvas events.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    coalesce::OutputCoalescer,
    config::SyncConfig,
    error::SyncError,
    frame::{Frame, Timestamp},
    graph::{Direction, GraphSnapshot},
    history::{ReplayCursor, UndoHistory},
    interpreter::Effect,
    layout::{LayoutDecision, LayoutScheduler},
    sequencer::FrameSequencer,
    store::ExecutionStore,
    timer::{Millis, TimerKey, Timers},
    traits::{CanvasEvent, LayoutEngine},
};

pub struct ExecutionSync {
    config: SyncConfig,
    store: ExecutionStore,
    sequencer: FrameSequencer,
    coalescer: OutputCoalescer,
    timers: Timers,
    layout: LayoutScheduler,
    engine: Arc<dyn LayoutEngine>,
    history: UndoHistory,
    replay: ReplayCursor,
    selected: Option<String>,
    outbox: Vec<CanvasEvent>,
}

impl ExecutionSync {
    #[must_use]
    pub fn new(exec_id: impl Into<String>, config: SyncConfig, engine: Arc<dyn LayoutEngine>) -> Self {
        Self {
            store: ExecutionStore::new(exec_id, config.output_limit_chars),
            sequencer: FrameSequencer::new(),
            coalescer: OutputCoalescer::new(config.output_limit_chars),
            timers: Timers::new(),
            layout: LayoutScheduler::new(config.layout_debounce_ms, config.direction),
            engine,
            history: UndoHistory::new(config.history_limit),
            replay: ReplayCursor::new(),
            selected: None,
            outbox: Vec::new(),
            config,
        }
    }

    #[must_use]
    pub fn exec_id(&self) -> &str {
        self.store.exec_id()
    }

    #[must_use]
    pub const fn store(&self) -> &ExecutionStore {
        &self.store
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.store.is_running()
    }

    #[must_use]
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    #[must_use]
    pub const fn history(&self) -> &UndoHistory {
        &self.history
    }

    #[must_use]
    pub const fn layout(&self) -> &LayoutScheduler {
        &self.layout
    }

    /// Earliest pending timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    /// Take the canvas events produced so far.
    pub fn drain_events(&mut self) -> Vec<CanvasEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Feed one frame from the transport.
    ///
    /// Frames for another execution, duplicates, and stale tokens are
    /// dropped. Never fails.
    pub fn handle_frame(&mut self, frame: &Frame, now: Millis) {
        let exec_id = frame.exec_id();
        if !exec_id.is_empty() && exec_id != self.store.exec_id() {
            tracing::warn!(expected = %self.store.exec_id(), got = exec_id, "frame for other execution dropped");
            return;
        }
        if !self.sequencer.admit(frame) {
            return;
        }

        match frame {
            Frame::Token(token) if token.is_final => {
                if let Some(text) = self.coalescer.take(&token.agent_id) {
                    self.store.append_output(&token.agent_id, &text);
                }
                self.store.apply_token(token);
            }
            Frame::Token(token) => {
                self.coalescer.push(&token.agent_id, &token.text);
                self.timers
                    .schedule_once(TimerKey::OutputFlush, now, self.config.flush_interval_ms);
            }
            Frame::Control(control) => {
                tracing::trace!(kind = control.event.kind(), agent = ?control.subject(), "control frame");
                let effects = self.store.apply_control(control);
                for effect in effects {
                    self.apply_effect(effect, now);
                }
            }
        }
        self.settle(now);
    }

    /// Fire every timer due at `now`.
    pub fn tick(&mut self, now: Millis) {
        for key in self.timers.take_due(now) {
            match key {
                TimerKey::Layout => {
                    self.layout.run(&mut self.store, self.engine.as_ref());
                    self.store.take_changes();
                    self.emit_snapshot();
                }
                TimerKey::OutputFlush => self.flush_output(),
                TimerKey::EdgePulse(id) => {
                    self.store.update_edge(&id, |edge| {
                        let was = edge.data.active;
                        edge.data.active = false;
                        was
                    });
                }
            }
        }
        self.settle(now);
    }

    /// Move every buffered token into agent output now.
    pub fn flush_output(&mut self) {
        self.timers.cancel(&TimerKey::OutputFlush);
        for (agent, text) in self.coalescer.drain() {
            self.store.append_output(&agent, &text);
        }
    }

    fn apply_effect(&mut self, effect: Effect, now: Millis) {
        match effect {
            Effect::Prompt(prompt) => self.outbox.push(CanvasEvent::Modal(prompt)),
            Effect::PulseEdges(ids) => {
                for id in ids {
                    self.store.update_edge(&id, |edge| {
                        let was = edge.data.active;
                        edge.data.active = true;
                        !was
                    });
                    self.timers
                        .schedule(TimerKey::EdgePulse(id), now, self.config.edge_pulse_ms);
                }
            }
            Effect::FullReset => {
                self.coalescer.clear();
                self.timers.clear();
                self.history.clear();
                self.replay.clear();
                self.selected = None;
            }
            Effect::SoftReset => {
                self.coalescer.clear();
                self.timers.cancel(&TimerKey::OutputFlush);
                self.replay.clear();
            }
            Effect::SessionEnded => self.flush_output(),
            Effect::ExecutionFailed(message) => {
                self.flush_output();
                self.outbox.push(CanvasEvent::Error(message));
            }
        }
    }

    /// Route drained changes through the layout scheduler.
    fn settle(&mut self, now: Millis) {
        let changes = self.store.take_changes();
        match self.layout.on_changes(changes, &mut self.timers, now) {
            LayoutDecision::Patch if !self.timers.is_pending(&TimerKey::Layout) => self.emit_snapshot(),
            LayoutDecision::Deferred => self.emit_snapshot(),
            _ => {}
        }
    }

    fn emit_snapshot(&mut self) {
        self.outbox
            .push(CanvasEvent::Snapshot(self.store.graph_snapshot()));
    }

    /// Current graph.
    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        self.store.graph_snapshot()
    }

    /// Stop the run: running agents fail and the job stops.
    pub fn stop_execution(&mut self, ts: Timestamp, now: Millis) {
        self.flush_output();
        self.store.fail_running(ts);
        self.settle(now);
    }

    // User edits. Each one is recorded for undo.

    fn edit<T>(
        &mut self,
        now: Millis,
        f: impl FnOnce(&mut ExecutionStore) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        // Undo lands on the graph as it is now, streamed changes included.
        self.history.refresh(self.store.checkpoint());
        let out = f(&mut self.store)?;
        self.history.push(self.store.checkpoint());
        self.settle(now);
        Ok(out)
    }

    /// # Errors
    /// Returns error if the node is unknown or the patch is invalid.
    pub fn update_node(&mut self, id: &str, patch: &Value, now: Millis) -> Result<(), SyncError> {
        self.edit(now, |store| store.update(id, patch))
    }

    /// # Errors
    /// Returns error if the node is unknown.
    pub fn delete_node(&mut self, id: &str, now: Millis) -> Result<(), SyncError> {
        self.edit(now, |store| store.delete(id))?;
        if self.selected.as_deref() == Some(id) {
            self.selected = None;
        }
        Ok(())
    }

    /// # Errors
    /// Returns error if the node is unknown.
    pub fn duplicate_node(&mut self, id: &str, now: Millis) -> Result<String, SyncError> {
        self.edit(now, |store| store.duplicate(id))
    }

    /// # Errors
    /// Returns error if an endpoint is unknown or the edge exists.
    pub fn connect_nodes(&mut self, source: &str, target: &str, now: Millis) -> Result<String, SyncError> {
        self.edit(now, |store| store.connect(source, target))
    }

    /// # Errors
    /// Returns error if the edge is unknown.
    pub fn disconnect_edge(&mut self, edge_id: &str, now: Millis) -> Result<(), SyncError> {
        self.edit(now, |store| store.disconnect_edge(edge_id))
    }

    /// # Errors
    /// Returns error if there is nothing to undo.
    pub fn undo(&mut self, now: Millis) -> Result<(), SyncError> {
        let checkpoint = self
            .history
            .undo()
            .cloned()
            .ok_or(SyncError::HistoryExhausted("undo"))?;
        self.store.restore(&checkpoint);
        self.settle(now);
        Ok(())
    }

    /// # Errors
    /// Returns error if there is nothing to redo.
    pub fn redo(&mut self, now: Millis) -> Result<(), SyncError> {
        let checkpoint = self
            .history
            .redo()
            .cloned()
            .ok_or(SyncError::HistoryExhausted("redo"))?;
        self.store.restore(&checkpoint);
        self.settle(now);
        Ok(())
    }

    // Replay and selection.

    fn focus(&mut self, id: String) {
        self.outbox.push(CanvasEvent::Focus(id.clone()));
        self.selected = Some(id);
    }

    /// Select the trace entry at `index` and focus it.
    ///
    /// # Errors
    /// Returns error if `index` is past the end of the trace.
    pub fn replay_seek(&mut self, index: usize) -> Result<String, SyncError> {
        let trace = self.store.trace();
        let id = self
            .replay
            .seek(trace, index)
            .map(str::to_string)
            .ok_or(SyncError::ReplayOutOfRange {
                index,
                len: trace.len(),
            })?;
        self.focus(id.clone());
        Ok(id)
    }

    /// Step the replay cursor forward. `None` at the end of the trace.
    pub fn replay_forward(&mut self) -> Option<String> {
        let id = self.replay.step_forward(self.store.trace())?.to_string();
        self.focus(id.clone());
        Some(id)
    }

    /// Step the replay cursor back. `None` at the start of the trace.
    pub fn replay_back(&mut self) -> Option<String> {
        let id = self.replay.step_back(self.store.trace())?.to_string();
        self.focus(id.clone());
        Some(id)
    }

    #[must_use]
    pub const fn replay_index(&self) -> Option<usize> {
        self.replay.index()
    }

    /// Select a node and dim everything off its paths.
    ///
    /// # Errors
    /// Returns error if the node is unknown.
    pub fn highlight_path(&mut self, id: &str, now: Millis) -> Result<(), SyncError> {
        self.store
            .highlight_path(id, self.config.highlight_max_rounds)?;
        self.selected = Some(id.to_string());
        self.settle(now);
        Ok(())
    }

    pub fn clear_highlight(&mut self, now: Millis) {
        self.store.clear_highlight();
        self.selected = None;
        self.settle(now);
    }

    // Canvas interaction.

    pub fn set_interacting(&mut self, interacting: bool, now: Millis) {
        self.layout.set_interacting(interacting, &mut self.timers, now);
    }

    pub fn set_direction(&mut self, direction: Direction, now: Millis) {
        self.layout.set_direction(direction, &mut self.timers, now);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        agent::AgentStatus,
        frame::{
            AgentStarted, ControlEvent, ControlFrame, EdgeFired, EdgeSpec, GraphPayload, NodeSpec, StateExited,
            TokenFrame, ToolUse,
        },
        layout::LayeredLayout,
    };

    fn sync() -> ExecutionSync {
        ExecutionSync::new("exec_1", SyncConfig::default(), Arc::new(LayeredLayout::default()))
    }

    fn control(agent: Option<&str>, event: ControlEvent) -> Frame {
        Frame::Control(ControlFrame::new("exec_1", agent, 0, event))
    }

    fn started(agent: &str) -> Frame {
        control(Some(agent), ControlEvent::AgentStarted(AgentStarted::default()))
    }

    fn token(agent: &str, seq: u64, text: &str) -> Frame {
        Frame::Token(TokenFrame {
            exec_id: "exec_1".into(),
            agent_id: agent.into(),
            seq,
            text: text.into(),
            ts: 0,
            is_final: false,
        })
    }

    fn snapshots(events: &[CanvasEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, CanvasEvent::Snapshot(_)))
            .count()
    }

    #[test]
    fn test_tokens_flush_on_cadence() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        sync.handle_frame(&token("a", 0, "he"), 1);
        sync.handle_frame(&token("a", 1, "llo"), 2);
        assert_eq!(sync.store().agent("a").unwrap().output, "");
        assert_eq!(sync.next_deadline(), Some(34));

        sync.tick(34);
        assert_eq!(sync.store().agent("a").unwrap().output, "hello");
    }

    #[test]
    fn test_final_token_flushes_agent() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        sync.handle_frame(&token("a", 0, "done"), 1);
        sync.handle_frame(
            &Frame::Token(TokenFrame {
                exec_id: "exec_1".into(),
                agent_id: "a".into(),
                seq: 0,
                text: String::new(),
                ts: 0,
                is_final: true,
            }),
            2,
        );
        let agent = sync.store().agent("a").unwrap();
        assert_eq!(agent.output, "done");
        assert!(agent.stream_closed);
    }

    #[test]
    fn test_layout_waits_for_debounce() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        assert_eq!(snapshots(&sync.drain_events()), 0);
        sync.tick(100);
        assert_eq!(snapshots(&sync.drain_events()), 0);
        sync.tick(150);
        assert_eq!(snapshots(&sync.drain_events()), 1);

        sync.handle_frame(
            &control(Some("a"), ControlEvent::ToolUse(ToolUse { tool: "x".into(), action: None })),
            200,
        );
        assert_eq!(snapshots(&sync.drain_events()), 1);
    }

    #[test]
    fn test_edge_pulse_clears() {
        let mut sync = sync();
        sync.handle_frame(
            &control(
                None,
                ControlEvent::GraphUpdated(GraphPayload {
                    nodes: vec![
                        NodeSpec { id: "a".into(), ..NodeSpec::default() },
                        NodeSpec { id: "b".into(), ..NodeSpec::default() },
                    ],
                    edges: vec![EdgeSpec { source: "a".into(), target: "b".into(), ..EdgeSpec::default() }],
                }),
            ),
            0,
        );
        sync.handle_frame(
            &control(
                None,
                ControlEvent::EdgeFired(EdgeFired {
                    edge_id: Some("a->b".into()),
                    ..EdgeFired::default()
                }),
            ),
            100,
        );
        assert!(sync.store().graph().edge("a->b").unwrap().data.active);
        sync.tick(1_599);
        assert!(sync.store().graph().edge("a->b").unwrap().data.active);
        sync.tick(1_600);
        let edge = sync.store().graph().edge("a->b").unwrap();
        assert!(!edge.data.active);
        assert!(edge.data.completed);
    }

    #[test]
    fn test_user_edits_undo_redo() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        let copy = sync.duplicate_node("a", 10).unwrap();
        sync.update_node(&copy, &json!({"label": "Beta"}), 20).unwrap();
        assert_eq!(sync.history().len(), 3);

        sync.undo(30).unwrap();
        assert_eq!(sync.store().graph().node(&copy).unwrap().data.label, "a (copy)");
        sync.undo(40).unwrap();
        assert!(sync.store().graph().node(&copy).is_none());
        assert!(sync.store().agent(&copy).is_none());
        assert!(matches!(sync.undo(50), Err(SyncError::HistoryExhausted("undo"))));

        sync.redo(60).unwrap();
        assert!(sync.store().agent(&copy).is_some());
    }

    #[test]
    fn test_undo_keeps_streamed_agents() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        let copy = sync.duplicate_node("a", 10).unwrap();
        sync.handle_frame(
            &Frame::Control(ControlFrame::new(
                "exec_1",
                Some("b"),
                20,
                ControlEvent::AgentStarted(AgentStarted::default()),
            )),
            20,
        );
        sync.handle_frame(
            &Frame::Control(ControlFrame::new(
                "exec_1",
                Some("a"),
                30,
                ControlEvent::StateExited(StateExited::default()),
            )),
            30,
        );

        sync.undo(40).unwrap();
        let store = sync.store();
        assert!(store.graph().node(&copy).is_none());
        assert!(store.agent(&copy).is_none());
        assert!(store.agent("b").is_some());
        assert!(store.graph().node("b").is_some());
        assert_eq!(store.agent("a").unwrap().status, AgentStatus::Completed);
        assert_eq!(store.graph().node("a").unwrap().data.status, AgentStatus::Completed);

        sync.handle_frame(
            &Frame::Control(ControlFrame::new(
                "exec_1",
                Some("b"),
                50,
                ControlEvent::StateExited(StateExited::default()),
            )),
            50,
        );
        assert_eq!(sync.store().agent("b").unwrap().status, AgentStatus::Completed);

        sync.redo(60).unwrap();
        assert!(sync.store().graph().node(&copy).is_some());
        assert!(sync.store().graph().node("b").is_some());
        assert_eq!(sync.store().graph().node("b").unwrap().data.status, AgentStatus::Completed);
    }

    #[test]
    fn test_undo_delete_restores_agent() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        sync.handle_frame(&token("a", 0, "partial"), 1);
        sync.flush_output();
        sync.delete_node("a", 10).unwrap();
        assert!(sync.store().agent("a").is_none());

        sync.undo(20).unwrap();
        let agent = sync.store().agent("a").unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.output, "partial");

        sync.redo(30).unwrap();
        assert!(sync.store().agent("a").is_none());
        assert!(sync.store().graph().node("a").is_none());
    }

    #[test]
    fn test_streaming_does_not_touch_history() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        sync.handle_frame(&started("b"), 1);
        assert!(sync.history().is_empty());
    }

    #[test]
    fn test_replay_focuses_without_mutation() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        sync.handle_frame(&started("b"), 1);
        sync.drain_events();
        let before = sync.store().snapshot();

        assert_eq!(sync.replay_forward().as_deref(), Some("a"));
        assert_eq!(sync.replay_seek(1).unwrap(), "b");
        assert!(sync.replay_seek(5).is_err());
        assert_eq!(
            sync.drain_events(),
            vec![CanvasEvent::Focus("a".into()), CanvasEvent::Focus("b".into())]
        );
        assert_eq!(sync.store().snapshot(), before);
        assert_eq!(sync.selected(), Some("b"));
    }

    #[test]
    fn test_stop_fails_running() {
        let mut sync = sync();
        sync.handle_frame(&started("a"), 0);
        sync.stop_execution(100, 5);
        assert_eq!(sync.store().agent("a").unwrap().status, AgentStatus::Failed);
        assert!(!sync.is_running());
    }

    #[test]
    fn test_other_execution_dropped() {
        let mut sync = sync();
        sync.handle_frame(
            &Frame::Control(ControlFrame::new(
                "exec_2",
                Some("a"),
                0,
                ControlEvent::AgentStarted(AgentStarted::default()),
            )),
            0,
        );
        assert!(sync.store().agent("a").is_none());
    }
}
