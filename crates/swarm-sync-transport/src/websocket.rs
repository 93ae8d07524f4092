//! WebSocket stream client with resumption.
//!
//! One [`TransportManager`] owns at most one live connection. Every
//! `connect` starts a new attempt; frames and status changes from a
//! superseded attempt are discarded.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use swarm_sync_core::{
    SyncConfig,
    frame::{ControlEvent, Frame},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::protocol::{ClientMessage, StartFrom, parse_frame, stream_url};

/// Connection status signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
}

/// A parsed frame tagged with the attempt that received it.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub attempt: u64,
    pub frame: Frame,
}

/// How a socket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Normal close handshake.
    Clean,
    /// Closed with an abnormal code or without a handshake.
    Unclean,
    /// Connect or I/O error.
    Failed,
}

impl Closure {
    fn from_close_frame(frame: Option<&CloseFrame<'_>>) -> Self {
        match frame {
            None => Self::Clean,
            Some(f) if f.code == CloseCode::Normal => Self::Clean,
            Some(_) => Self::Unclean,
        }
    }
}

/// Whether a session that ended with `closure` is resumed.
#[must_use]
pub const fn should_reconnect(closure: Closure, running: bool) -> bool {
    running && !matches!(closure, Closure::Clean)
}

struct Shared {
    base_url: String,
    reconnect_delay: Duration,
    keepalive_interval: Duration,
    attempt: AtomicU64,
    running: AtomicBool,
    status: watch::Sender<ConnectionStatus>,
    frames: mpsc::UnboundedSender<InboundFrame>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
}

impl Shared {
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) == attempt
    }

    fn set_status(&self, attempt: u64, status: ConnectionStatus) {
        if self.is_current(attempt) {
            self.status.send_replace(status);
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<ClientMessage>>) {
        match self.outbound.lock() {
            Ok(mut outbound) => *outbound = tx,
            Err(e) => tracing::error!("outbound lock poisoned: {e}"),
        }
    }

    fn forward(&self, text: &str, attempt: u64) {
        if !self.is_current(attempt) {
            return;
        }
        match parse_frame(text) {
            Ok(Frame::Control(control)) if matches!(control.event, ControlEvent::Pong(_)) => {
                tracing::trace!("pong");
            }
            Ok(frame) => {
                // Must be settled before the close that follows is classified.
                if let Frame::Control(control) = &frame {
                    if control.ends_execution() {
                        self.running.store(false, Ordering::SeqCst);
                    } else if matches!(
                        control.event,
                        ControlEvent::ExecutionStarted(_) | ControlEvent::RerunStarted(_)
                    ) {
                        self.running.store(true, Ordering::SeqCst);
                    }
                }
                let _ = self.frames.send(InboundFrame { attempt, frame });
            }
            Err(e) => tracing::warn!("Malformed frame dropped: {e}"),
        }
    }

    async fn run(self: Arc<Self>, exec_id: String, mut resume: bool, attempt: u64) {
        loop {
            let closure = self.session(&exec_id, resume, attempt).await;
            if !self.is_current(attempt) {
                return;
            }
            let running = self.running.load(Ordering::SeqCst);
            if !should_reconnect(closure, running) {
                tracing::info!(exec = %exec_id, ?closure, running, "stream closed");
                return;
            }
            tracing::info!(
                exec = %exec_id,
                ?closure,
                delay_ms = self.reconnect_delay.as_millis(),
                "stream lost, resuming"
            );
            tokio::time::sleep(self.reconnect_delay).await;
            if !self.is_current(attempt) {
                return;
            }
            resume = true;
        }
    }

    async fn session(&self, exec_id: &str, resume: bool, attempt: u64) -> Closure {
        let url = stream_url(&self.base_url, exec_id, StartFrom::for_resume(resume));
        self.set_status(attempt, ConnectionStatus::Connecting);

        let ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                tracing::error!(url = %url, "Stream connect failed: {e}");
                self.set_status(attempt, ConnectionStatus::Error);
                return Closure::Failed;
            }
        };
        if !self.is_current(attempt) {
            return Closure::Clean;
        }
        tracing::info!(exec = %exec_id, resume, "stream connected");
        self.set_status(attempt, ConnectionStatus::Connected);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        self.set_outbound(Some(out_tx));
        let mut keepalive = interval_at(Instant::now() + self.keepalive_interval, self.keepalive_interval);

        let closure = loop {
            let outgoing = tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.forward(&text, attempt);
                        continue;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match String::from_utf8(data) {
                            Ok(text) => self.forward(&text, attempt),
                            Err(_) => tracing::warn!("Non-UTF-8 binary frame dropped"),
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => break Closure::from_close_frame(frame.as_ref()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!(exec = %exec_id, "Stream error: {e}");
                        break Closure::Failed;
                    }
                    None => break Closure::Unclean,
                },
                Some(message) = out_rx.recv() => message,
                _ = keepalive.tick() => ClientMessage::Ping,
            };

            let json = match serde_json::to_string(&outgoing) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(json)).await {
                tracing::error!(exec = %exec_id, "Stream send failed: {e}");
                break Closure::Failed;
            }
        };

        self.set_outbound(None);
        let status = if closure == Closure::Failed {
            ConnectionStatus::Error
        } else {
            ConnectionStatus::Disconnected
        };
        self.set_status(attempt, status);
        closure
    }
}

/// Client connection manager for one execution stream at a time.
pub struct TransportManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportManager {
    /// Create a manager and the receiver its frames are delivered on.
    #[must_use]
    pub fn new(config: &SyncConfig) -> (Self, mpsc::UnboundedReceiver<InboundFrame>) {
        let (frames, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared {
            base_url: config.ws_base_url.clone(),
            reconnect_delay: config.reconnect_delay(),
            keepalive_interval: config.keepalive_interval(),
            attempt: AtomicU64::new(0),
            running: AtomicBool::new(false),
            status,
            frames,
            outbound: Mutex::new(None),
        });
        let manager = Self {
            shared,
            task: Mutex::new(None),
        };
        (manager, rx)
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Whether a frame came from the live attempt.
    #[must_use]
    pub fn is_current(&self, frame: &InboundFrame) -> bool {
        self.shared.is_current(frame.attempt)
    }

    /// Whether the job is still running; gates reconnects.
    pub fn set_running(&self, running: bool) {
        self.shared.running.store(running, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Open the stream for `exec_id`, closing any existing connection.
    ///
    /// Returns the new attempt id.
    pub fn connect(&self, exec_id: &str, resume: bool) -> u64 {
        self.disconnect();
        let attempt = self.shared.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_running(true);

        let handle = tokio::spawn(Arc::clone(&self.shared).run(exec_id.to_string(), resume, attempt));
        match self.task.lock() {
            Ok(mut task) => *task = Some(handle),
            Err(e) => {
                tracing::error!("transport task lock poisoned: {e}");
                handle.abort();
            }
        }
        attempt
    }

    /// Close the connection now and cancel any pending reconnect.
    pub fn disconnect(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        self.shared.attempt.fetch_add(1, Ordering::SeqCst);
        self.shared.set_outbound(None);
        self.shared.status.send_replace(ConnectionStatus::Disconnected);
    }

    /// Queue a message on the live connection.
    ///
    /// # Errors
    /// Returns error if no connection is open.
    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let outbound = self
            .shared
            .outbound
            .lock()
            .map_err(|_| TransportError::NotConnected)?;
        outbound
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(message)
            .map_err(|_| TransportError::NotConnected)
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
