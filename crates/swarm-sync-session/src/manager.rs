//! Execution manager: one synchronizer task per watched execution.
//!
//! Each watched execution gets a driver task that exclusively owns its
//! [`ExecutionSync`]. Frames, clock ticks, and user commands are processed
//! one at a time in that task; canvas events fan out through a
//! [`CanvasFeed`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::Value;
use swarm_sync_core::{
    CanvasEvent, CanvasFeed, Direction, ExecutionSync, GraphMode, LayoutEngine, Millis, SessionRecord,
    SessionStorage, StorageError, SyncConfig, SyncError,
};
use swarm_sync_transport::{ClientMessage, CommandClient, CommandError, InboundFrame, TransportManager};
use tokio::{
    sync::{RwLock, mpsc},
    task::JoinHandle,
    time::Instant,
};

/// Execution manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("Execution not watched: {0}")]
    NotFound(String),
    #[error("Execution already watched: {0}")]
    AlreadyWatching(String),
    #[error("Execution task closed: {0}")]
    Closed(String),
}

/// User command routed to an execution's synchronizer.
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// JSON merge patch over a node's data.
    UpdateNode { id: String, patch: Value },
    DeleteNode(String),
    DuplicateNode(String),
    Connect { source: String, target: String },
    DisconnectEdge(String),
    Undo,
    Redo,
    ReplaySeek(usize),
    ReplayForward,
    ReplayBack,
    Highlight(String),
    ClearHighlight,
    /// Canvas pan/drag started or ended.
    SetInteracting(bool),
    SetDirection(Direction),
    /// Fail running agents and mark the job stopped.
    Stop,
    /// Outbound message, e.g. a human decision.
    Send(ClientMessage),
}

/// Active execution state.
struct ActiveExecution {
    commands: mpsc::UnboundedSender<SyncCommand>,
    feed: Arc<CanvasFeed>,
    task: JoinHandle<()>,
}

/// Manager for watched executions.
pub struct SyncManager<S>
where
    S: SessionStorage,
{
    config: SyncConfig,
    storage: S,
    engine: Arc<dyn LayoutEngine>,
    commands: CommandClient,
    active: RwLock<HashMap<String, ActiveExecution>>,
}

impl<S> SyncManager<S>
where
    S: SessionStorage,
{
    /// Create a new execution manager.
    #[must_use]
    pub fn new(config: SyncConfig, storage: S, engine: Arc<dyn LayoutEngine>) -> Self {
        let commands = CommandClient::new(config.api_base_url.clone());
        Self {
            config,
            storage,
            engine,
            commands,
            active: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Start a state-machine execution on the backend and watch it.
    ///
    /// # Errors
    /// Returns error if the backend rejects the request or storage fails.
    pub async fn start(&self, title: &str, request: &Value) -> Result<(String, Arc<CanvasFeed>), ManagerError> {
        let exec_id = self.commands.start(request).await?;
        self.storage
            .put(SessionRecord {
                id: exec_id.clone(),
                title: title.to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                mode: GraphMode::StateMachine,
            })
            .await?;
        let feed = self.watch(&exec_id, false).await?;
        Ok((exec_id, feed))
    }

    /// Connect to an execution's stream and start synchronizing it.
    ///
    /// # Errors
    /// Returns error if the execution is already watched or storage fails.
    pub async fn watch(&self, exec_id: &str, resume: bool) -> Result<Arc<CanvasFeed>, ManagerError> {
        let mut active = self.active.write().await;
        if active.contains_key(exec_id) {
            return Err(ManagerError::AlreadyWatching(exec_id.to_string()));
        }

        if self.storage.get(exec_id).await?.is_none() {
            self.storage
                .put(SessionRecord {
                    id: exec_id.to_string(),
                    title: exec_id.to_string(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    mode: GraphMode::Tree,
                })
                .await?;
        }

        let (transport, frames) = TransportManager::new(&self.config);
        transport.connect(exec_id, resume);

        let feed = Arc::new(CanvasFeed::new());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let sync = ExecutionSync::new(exec_id, self.config.clone(), Arc::clone(&self.engine));
        let task = tokio::spawn(drive(sync, transport, frames, commands_rx, Arc::clone(&feed)));

        tracing::info!(exec = exec_id, resume, "watching execution");
        active.insert(
            exec_id.to_string(),
            ActiveExecution {
                commands: commands_tx,
                feed: Arc::clone(&feed),
                task,
            },
        );
        Ok(feed)
    }

    /// Stop watching an execution and close its connection.
    ///
    /// # Errors
    /// Returns error if the execution is not watched.
    pub async fn unwatch(&self, exec_id: &str) -> Result<(), ManagerError> {
        let execution = self
            .active
            .write()
            .await
            .remove(exec_id)
            .ok_or_else(|| ManagerError::NotFound(exec_id.to_string()))?;
        execution.task.abort();
        tracing::info!(exec = exec_id, "stopped watching execution");
        Ok(())
    }

    /// Get the canvas feed for an execution.
    pub async fn get_feed(&self, exec_id: &str) -> Option<Arc<CanvasFeed>> {
        self.active
            .read()
            .await
            .get(exec_id)
            .map(|e| Arc::clone(&e.feed))
    }

    /// Route a user command to an execution's synchronizer.
    ///
    /// # Errors
    /// Returns error if the execution is not watched or its task ended.
    pub async fn send(&self, exec_id: &str, command: SyncCommand) -> Result<(), ManagerError> {
        let active = self.active.read().await;
        let execution = active
            .get(exec_id)
            .ok_or_else(|| ManagerError::NotFound(exec_id.to_string()))?;
        execution
            .commands
            .send(command)
            .map_err(|_| ManagerError::Closed(exec_id.to_string()))
    }

    /// Stop an execution on the backend and locally.
    ///
    /// A failed request is surfaced on the feed; streaming state is left
    /// untouched.
    ///
    /// # Errors
    /// Returns error if the request fails or the execution is not watched.
    pub async fn stop(&self, exec_id: &str) -> Result<(), ManagerError> {
        if let Err(e) = self.commands.stop(exec_id).await {
            self.report(exec_id, &e).await;
            return Err(e.into());
        }
        self.send(exec_id, SyncCommand::Stop).await
    }

    /// Rerun an execution from a state.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn rerun_from(&self, exec_id: &str, state_id: &str) -> Result<(), ManagerError> {
        if let Err(e) = self.commands.rerun_from(exec_id, state_id).await {
            self.report(exec_id, &e).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Recent sessions, newest first.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub async fn sessions(&self, limit: Option<usize>) -> Result<Vec<SessionRecord>, ManagerError> {
        Ok(self.storage.list(limit).await?)
    }

    async fn report(&self, exec_id: &str, error: &CommandError) {
        tracing::error!(exec = exec_id, "Command failed: {error}");
        if let Some(feed) = self.get_feed(exec_id).await {
            feed.push(CanvasEvent::Error(error.to_string()));
        }
    }
}

fn elapsed_ms(origin: Instant) -> Millis {
    Millis::try_from(origin.elapsed().as_millis()).unwrap_or(Millis::MAX)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Apply one user command. Errors are returned for the feed.
fn apply_command(
    sync: &mut ExecutionSync,
    transport: &TransportManager,
    command: SyncCommand,
    now: Millis,
) -> Result<(), String> {
    let result: Result<(), SyncError> = match command {
        SyncCommand::UpdateNode { id, patch } => sync.update_node(&id, &patch, now),
        SyncCommand::DeleteNode(id) => sync.delete_node(&id, now),
        SyncCommand::DuplicateNode(id) => sync.duplicate_node(&id, now).map(|_| ()),
        SyncCommand::Connect { source, target } => sync.connect_nodes(&source, &target, now).map(|_| ()),
        SyncCommand::DisconnectEdge(id) => sync.disconnect_edge(&id, now),
        SyncCommand::Undo => sync.undo(now),
        SyncCommand::Redo => sync.redo(now),
        SyncCommand::ReplaySeek(index) => sync.replay_seek(index).map(|_| ()),
        SyncCommand::ReplayForward => {
            sync.replay_forward();
            Ok(())
        }
        SyncCommand::ReplayBack => {
            sync.replay_back();
            Ok(())
        }
        SyncCommand::Highlight(id) => sync.highlight_path(&id, now),
        SyncCommand::ClearHighlight => {
            sync.clear_highlight(now);
            Ok(())
        }
        SyncCommand::SetInteracting(interacting) => {
            sync.set_interacting(interacting, now);
            Ok(())
        }
        SyncCommand::SetDirection(direction) => {
            sync.set_direction(direction, now);
            Ok(())
        }
        SyncCommand::Stop => {
            sync.stop_execution(chrono::Utc::now().timestamp_millis(), now);
            Ok(())
        }
        SyncCommand::Send(message) => return transport.send(message).map_err(|e| e.to_string()),
    };
    result.map_err(|e| e.to_string())
}

/// Event loop for one execution.
async fn drive(
    mut sync: ExecutionSync,
    transport: TransportManager,
    mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    mut commands: mpsc::UnboundedReceiver<SyncCommand>,
    feed: Arc<CanvasFeed>,
) {
    let origin = Instant::now();
    loop {
        let deadline = sync
            .next_deadline()
            .map(|ms| origin + Duration::from_millis(ms));

        tokio::select! {
            Some(inbound) = frames.recv() => {
                if transport.is_current(&inbound) {
                    sync.handle_frame(&inbound.frame, elapsed_ms(origin));
                }
            }
            () = sleep_until(deadline) => sync.tick(elapsed_ms(origin)),
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                if let Err(message) = apply_command(&mut sync, &transport, command, elapsed_ms(origin)) {
                    tracing::warn!(exec = sync.exec_id(), "Command rejected: {message}");
                    feed.push(CanvasEvent::Error(message));
                }
            }
        }

        // The transport raises the flag itself when a new run starts.
        if !sync.is_running() {
            transport.set_running(false);
        }
        for event in sync.drain_events() {
            feed.push(event);
        }
    }
    transport.disconnect();
    tracing::debug!(exec = sync.exec_id(), "execution task finished");
}
