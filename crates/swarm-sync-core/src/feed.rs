//! Broadcast feed of canvas events with latest-snapshot replay.

use std::sync::{Arc, RwLock};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{graph::GraphSnapshot, traits::CanvasEvent};

const CHANNEL_CAPACITY: usize = 1024;

/// Canvas event feed for one execution.
///
/// Late subscribers first receive the most recent snapshot, then live
/// events. Snapshots are read-only copies; the canvas never mutates the
/// store through them.
pub struct CanvasFeed {
    latest: RwLock<Option<GraphSnapshot>>,
    sender: broadcast::Sender<CanvasEvent>,
}

impl Default for CanvasFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasFeed {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            latest: RwLock::new(None),
            sender,
        }
    }

    /// Publish an event to live listeners, remembering snapshots.
    pub fn push(&self, event: CanvasEvent) {
        if let CanvasEvent::Snapshot(snapshot) = &event {
            match self.latest.write() {
                Ok(mut latest) => *latest = Some(snapshot.clone()),
                Err(e) => tracing::error!("canvas feed lock poisoned: {e}"),
            }
        }
        let _ = self.sender.send(event);
    }

    /// Most recent snapshot, if any.
    #[must_use]
    pub fn latest(&self) -> Option<GraphSnapshot> {
        self.latest.read().ok().and_then(|l| l.clone())
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CanvasEvent> {
        self.sender.subscribe()
    }

    /// Stream yielding the latest snapshot first, then live events.
    ///
    /// Lagged receivers skip missed events; the next snapshot supersedes
    /// them.
    #[must_use]
    pub fn latest_plus_stream(&self) -> futures::stream::BoxStream<'static, CanvasEvent> {
        let (latest, rx) = (self.latest(), self.subscribe());

        let head = futures::stream::iter(latest.map(CanvasEvent::Snapshot));
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("canvas subscriber lagged: {e}");
                    None
                }
            }
        });

        Box::pin(head.chain(live))
    }

    /// Forward every feed event into a sink until the feed closes.
    pub fn spawn_forwarder<C>(self: Arc<Self>, sink: C) -> tokio::task::JoinHandle<()>
    where
        C: crate::traits::CanvasSink + 'static,
    {
        tokio::spawn(async move {
            let stream = self.latest_plus_stream();
            tokio::pin!(stream);
            while let Some(event) = stream.next().await {
                event.deliver(&sink);
            }
        })
    }
}
