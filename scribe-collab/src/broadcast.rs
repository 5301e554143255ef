//! Per-document fan-out of admitted operations and presence events.
//!
//! Two tokio broadcast channels per document: one for content, strictly
//! in version order, one for presence. Each [`Subscription`] checks that
//! content versions arrive without gaps; a receiver that falls more than
//! `capacity` messages behind reports [`SubscriptionError::Lagged`] and
//! must resynchronize from a fresh synchronization point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scribe_core::Edit;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::presence::{PeerPresence, SessionId};

/// An admitted operation as seen by every subscriber, author included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationBroadcast {
    pub document: Uuid,
    pub version: u64,
    pub author: Uuid,
    pub session: SessionId,
    pub client_seq: u64,
    /// Edits as applied, relative to the text at `version - 1`.
    pub edits: Vec<Edit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined(PeerPresence),
    Updated(PeerPresence),
    Left { session: SessionId, user: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Operation(Arc<OperationBroadcast>),
    Presence(Arc<PresenceEvent>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Events were missed; the subscriber must resynchronize.
    #[error("subscriber lagged behind version {last_version}")]
    Lagged { last_version: u64 },

    /// The document actor has shut down.
    #[error("broadcast closed")]
    Closed,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub presence_sent: u64,
    pub lagged: u64,
    pub subscribers: usize,
}

/// Lock-free counters shared with every subscription.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    presence_sent: AtomicU64,
    lagged: AtomicU64,
}

/// Broadcast channels of one document.
pub struct BroadcastGroup {
    document: Uuid,
    ops: broadcast::Sender<Arc<OperationBroadcast>>,
    presence: broadcast::Sender<Arc<PresenceEvent>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of events buffered per subscriber before it
    /// is considered lagged.
    pub fn new(document: Uuid, capacity: usize) -> Self {
        let (ops, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        Self {
            document,
            ops,
            presence,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Subscribe at synchronization point `version`.
    ///
    /// Must be called while no operation past `version` can be published,
    /// i.e. inside the actor step that captured the synchronization point.
    pub fn subscribe(&self, version: u64) -> Subscription {
        Subscription {
            document: self.document,
            ops: self.ops.subscribe(),
            presence: self.presence.subscribe(),
            last_version: version,
            stats: self.stats.clone(),
        }
    }

    /// Publish an admitted operation. Returns the number of receivers.
    pub fn publish_operation(&self, op: OperationBroadcast) -> usize {
        let count = self.ops.send(Arc::new(op)).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn publish_presence(&self, event: PresenceEvent) -> usize {
        let count = self.presence.send(Arc::new(event)).unwrap_or(0);
        self.stats.presence_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Live subscriptions.
    pub fn receiver_count(&self) -> usize {
        self.ops.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            presence_sent: self.stats.presence_sent.load(Ordering::Relaxed),
            lagged: self.stats.lagged.load(Ordering::Relaxed),
            subscribers: self.receiver_count(),
        }
    }
}

/// One subscriber's view of a document's broadcasts.
#[derive(Debug)]
pub struct Subscription {
    document: Uuid,
    ops: broadcast::Receiver<Arc<OperationBroadcast>>,
    presence: broadcast::Receiver<Arc<PresenceEvent>>,
    last_version: u64,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn document(&self) -> Uuid {
        self.document
    }

    /// Last content version delivered (or the synchronization point).
    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    /// Next event. Content operations come out in version order with no
    /// gaps; anything else is reported as an error.
    pub async fn next(&mut self) -> Result<SubscriptionEvent, SubscriptionError> {
        loop {
            tokio::select! {
                biased;
                res = self.ops.recv() => match res {
                    Ok(op) => {
                        if op.version <= self.last_version {
                            continue;
                        }
                        if op.version != self.last_version + 1 {
                            return Err(self.lagged());
                        }
                        self.last_version = op.version;
                        return Ok(SubscriptionEvent::Operation(op));
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Subscriber on {} missed {n} operations", self.document);
                        return Err(self.lagged());
                    }
                    Err(RecvError::Closed) => return Err(SubscriptionError::Closed),
                },
                res = self.presence.recv() => match res {
                    Ok(event) => return Ok(SubscriptionEvent::Presence(event)),
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Subscriber on {} missed {n} presence events", self.document);
                        return Err(self.lagged());
                    }
                    Err(RecvError::Closed) => return Err(SubscriptionError::Closed),
                },
            }
        }
    }

    fn lagged(&self) -> SubscriptionError {
        self.stats.lagged.fetch_add(1, Ordering::Relaxed);
        SubscriptionError::Lagged {
            last_version: self.last_version,
        }
    }
}
