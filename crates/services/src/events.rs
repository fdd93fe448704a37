//! Progress change notifications.
//!
//! The repository broadcasts an event after every committed mutation.
//! Subscriptions are plain broadcast receivers: dropping the subscription
//! unsubscribes, and a slow consumer only ever loses its own backlog.

use quiz_core::model::{CategoryId, SessionId, SessionMode};
use tokio::sync::broadcast;

/// Something observable happened to the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProgressEvent {
    /// The document was loaded, adopted from a sync merge, or replaced.
    Loaded { identity: String },
    AnswerRecorded { category: CategoryId, correct: bool },
    SessionCompleted {
        session_id: SessionId,
        mode: SessionMode,
    },
    Reset,
}

/// A live subscription to progress events.
pub struct EventSubscription {
    rx: broadcast::Receiver<ProgressEvent>,
}

impl EventSubscription {
    /// Next event, waiting for one if none is queued.
    ///
    /// Returns `None` once the repository is gone. Events missed while the
    /// consumer lagged are skipped, not replayed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast fan-out owned by the repository.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Delivery is best effort; no subscribers is not an error.
    pub(crate) fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}
