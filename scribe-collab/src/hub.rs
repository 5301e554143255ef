//! The arena of document actors.
//!
//! ```text
//!                  ┌──────────────────────────── DocumentHub ─┐
//! connection ──►   │ SessionRegistry   actors: doc → handle   │
//!                  └──────┬────────────────┬─────────────────┘
//!                         │                ▼
//!                         │        DocumentActor (one per doc)
//!                         └── routes leaves on disconnect
//! ```
//!
//! Actors are spawned on first use and stop on their own once a document
//! has been idle for the eviction grace period; the next call spawns a
//! fresh one from the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scribe_core::{
    verify_history, Document, DocumentVersion, Edit, IntegrityIssue, IntegrityReport, Operation,
    PermissionGate, SyncError,
};
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

use crate::actor::{Ack, ActorHandle, Caller, Command, DocumentAction, DocumentActor, Subscribed, SyncPoint};
use crate::broadcast::Subscription;
use crate::presence::{PeerPresence, Selection, SessionId};
use crate::registry::{ConnectionId, SessionRegistry};
use crate::storage::VersionStore;

/// Attempts per call when an actor shuts down underneath it.
const CALL_ATTEMPTS: usize = 2;

/// Tuning shared by every document actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Events buffered per subscriber before it is considered lagged
    pub broadcast_capacity: usize,
    /// Bounded command queue per actor
    pub inbox_capacity: usize,
    /// Sessions idle for longer than this are removed
    pub idle_timeout: Duration,
    /// How often actors sweep idle sessions
    pub sweep_interval: Duration,
    /// How long an unused actor lingers before stopping
    pub eviction_grace: Duration,
    /// Admitted versions kept in memory for rebasing
    pub history_window: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            inbox_capacity: 64,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            eviction_grace: Duration::from_secs(60),
            history_window: 512,
        }
    }
}

pub struct DocumentHub {
    config: HubConfig,
    store: Arc<dyn VersionStore>,
    gate: Arc<dyn PermissionGate>,
    registry: SessionRegistry,
    actors: RwLock<HashMap<Uuid, ActorHandle>>,
}

impl DocumentHub {
    pub fn new(store: Arc<dyn VersionStore>, gate: Arc<dyn PermissionGate>, config: HubConfig) -> Self {
        Self {
            config,
            store,
            gate,
            registry: SessionRegistry::new(),
            actors: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Create and persist an empty-history document owned by `owner`.
    pub async fn create_document(
        &self,
        owner: Uuid,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Document, SyncError> {
        let doc = Document::new(title, content, owner);
        self.store.put_document(&doc).await?;
        log::info!("Created document {} ({:?}) for {owner}", doc.id, doc.title);
        Ok(doc)
    }

    /// Register a transport connection for `user`.
    pub fn connect(&self, user: Uuid) -> ConnectionId {
        let connection = self.registry.connect(user);
        log::debug!("Connection {connection} opened for {user}");
        connection
    }

    /// Subscribe a connection to a document. Subscribing twice resyncs the
    /// existing session instead of creating a second one.
    pub async fn subscribe(&self, connection: &ConnectionId, document: Uuid) -> Result<Subscribed, SyncError> {
        let user = self.user_of(connection)?;

        if let Some(session) = self.registry.session(connection, document) {
            let (sync, subscription) = self.resync(connection, document).await?;
            return Ok(Subscribed {
                session,
                sync,
                subscription,
            });
        }

        let subscribed = self
            .call(document, |reply| Command::Subscribe {
                user,
                connection: connection.clone(),
                reply,
            })
            .await??;

        if !self
            .registry
            .bind(connection, document, subscribed.session.clone())
        {
            // The connection closed while subscribing.
            self.leave(document, subscribed.session).await;
            return Err(SyncError::Unauthorized);
        }
        Ok(subscribed)
    }

    /// Fresh synchronization point for a subscriber that fell behind.
    pub async fn resync(
        &self,
        connection: &ConnectionId,
        document: Uuid,
    ) -> Result<(SyncPoint, Subscription), SyncError> {
        let caller = self.caller(connection, document)?;
        self.call(document, |reply| Command::Resync {
            caller: caller.clone(),
            reply,
        })
        .await?
    }

    pub async fn submit(
        &self,
        connection: &ConnectionId,
        document: Uuid,
        base_version: u64,
        client_seq: u64,
        edits: Vec<Edit>,
    ) -> Result<Ack, SyncError> {
        let caller = self.caller(connection, document)?;
        let op = Operation::new(caller.user, document, base_version, edits).with_client_seq(client_seq);
        self.call(document, |reply| Command::Submit {
            caller: caller.clone(),
            op: op.clone(),
            reply,
        })
        .await?
    }

    pub async fn update_presence(
        &self,
        connection: &ConnectionId,
        document: Uuid,
        cursor: usize,
        selection: Selection,
    ) -> Result<(), SyncError> {
        let caller = self.caller(connection, document)?;
        self.call(document, |reply| Command::Presence {
            caller: caller.clone(),
            cursor,
            selection,
            reply,
        })
        .await?
    }

    /// Heartbeat: refreshes the session without moving the cursor.
    pub async fn touch(&self, connection: &ConnectionId, document: Uuid) -> Result<(), SyncError> {
        let caller = self.caller(connection, document)?;
        self.call(document, |reply| Command::Touch {
            caller: caller.clone(),
            reply,
        })
        .await?
    }

    /// End one subscription. Returns whether the connection was subscribed.
    pub async fn unsubscribe(&self, connection: &ConnectionId, document: Uuid) -> Result<bool, SyncError> {
        self.user_of(connection)?;
        match self.registry.unbind(connection, document) {
            Some(session) => {
                self.leave(document, session).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forget a connection and end every session it held. Returns the
    /// number of documents it was subscribed to.
    pub async fn disconnect(&self, connection: &ConnectionId) -> usize {
        let Some(gone) = self.registry.disconnect(connection) else {
            return 0;
        };
        let count = gone.bindings.len();
        for (document, session) in gone.bindings {
            self.leave(document, session).await;
        }
        log::debug!("Connection {connection} of {} closed, left {count} documents", gone.user);
        count
    }

    /// Sessions currently subscribed to a document. Requires view access.
    pub async fn active_sessions(&self, user: Uuid, document: Uuid) -> Result<Vec<PeerPresence>, SyncError> {
        self.call(document, |reply| Command::Sessions { user, reply }).await?
    }

    /// Current in-memory state of a document. Requires view access.
    pub async fn snapshot(&self, user: Uuid, document: Uuid) -> Result<Document, SyncError> {
        self.call(document, |reply| Command::Snapshot { user, reply }).await?
    }

    pub async fn manage(&self, user: Uuid, document: Uuid, action: DocumentAction) -> Result<Document, SyncError> {
        self.call(document, |reply| Command::Manage {
            user,
            action: action.clone(),
            reply,
        })
        .await?
    }

    /// Versions after `since`, ascending. Requires view access.
    pub async fn history(&self, user: Uuid, document: Uuid, since: u64) -> Result<Vec<DocumentVersion>, SyncError> {
        self.call(document, |reply| Command::History { user, since, reply })
            .await?
    }

    /// Audit the full stored history of a document, from version 1 up to
    /// its current version.
    pub async fn verify_history(&self, user: Uuid, document: Uuid) -> Result<IntegrityReport, SyncError> {
        // Read the version first: admissions in between only lengthen the history.
        let current = self.snapshot(user, document).await?.version;
        let versions = self.history(user, document, 0).await?;
        let mut report = verify_history(&versions);
        let stored = versions.last().map_or(0, |v| v.version);
        if stored < current {
            report.issues.push(IntegrityIssue::Truncated { stored, current });
        }
        if report.is_clean() {
            log::debug!("History of {document} verified: {} versions", report.checked);
        } else {
            log::warn!("History of {document} has {} integrity issues", report.issues.len());
        }
        Ok(report)
    }

    /// Documents with a running actor.
    pub async fn open_documents(&self) -> usize {
        self.actors
            .read()
            .await
            .values()
            .filter(|h| !h.is_closed())
            .count()
    }

    fn user_of(&self, connection: &ConnectionId) -> Result<Uuid, SyncError> {
        self.registry
            .resolve(connection)
            .ok_or(SyncError::Unauthorized)
    }

    fn caller(&self, connection: &ConnectionId, document: Uuid) -> Result<Caller, SyncError> {
        let user = self.user_of(connection)?;
        let session = self
            .registry
            .session(connection, document)
            .ok_or_else(|| SyncError::invalid(format!("not subscribed to {document}")))?;
        Ok(Caller {
            user,
            connection: connection.clone(),
            session,
        })
    }

    /// Remove a session from a running actor. An actor that already stopped
    /// has no sessions left to remove.
    async fn leave(&self, document: Uuid, session: SessionId) {
        let handle = self.actors.read().await.get(&document).cloned();
        if let Some(handle) = handle {
            let _ = handle.request(|reply| Command::Leave { session, reply }).await;
        }
    }

    /// Send a command, retrying once on a fresh actor if the current one
    /// stopped before answering.
    async fn call<T>(
        &self,
        document: Uuid,
        make: impl Fn(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        for attempt in 1..=CALL_ATTEMPTS {
            let handle = self.get_or_spawn(document).await?;
            match handle.request(&make).await {
                Ok(value) => return Ok(value),
                Err(_) => log::debug!("Actor for {document} stopped during call (attempt {attempt})"),
            }
        }
        Err(SyncError::internal(format!("actor for {document} unavailable")))
    }

    /// Running actor for a document, spawning one from the store if needed.
    async fn get_or_spawn(&self, document: Uuid) -> Result<ActorHandle, SyncError> {
        // Fast path: read lock
        {
            let actors = self.actors.read().await;
            if let Some(handle) = actors.get(&document) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        let doc = self.store.load_document(document).await?;

        // Slow path: write lock + double-check
        let mut actors = self.actors.write().await;
        if let Some(handle) = actors.get(&document) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        actors.retain(|_, h| !h.is_closed());

        let handle = DocumentActor::spawn(doc, self.store.clone(), self.gate.clone(), self.config.clone());
        actors.insert(document, handle.clone());
        Ok(handle)
    }
}
