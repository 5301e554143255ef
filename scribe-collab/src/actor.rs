//! One sequential admission pipeline per open document.
//!
//! ```text
//!  DocumentHub ──Command──► inbox (mpsc) ──► DocumentActor ──► VersionStore
//!                                                 │
//!                                                 ├── PresenceTracker
//!                                                 └── BroadcastGroup ──► Subscriptions
//! ```
//!
//! The actor exclusively owns the live text, version counter and presence
//! of its document. Commands are handled one at a time, and the durable
//! append is awaited inside the handler, so no second operation can be
//! rebased against a version that is still being written.

use std::collections::VecDeque;
use std::sync::Arc;

use scribe_core::{
    access_level, apply, clamp_edits, length_delta, transform_edits, Document, DocumentVersion, Edit,
    Operation, PermissionGate, PermissionLevel, SyncError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, OperationBroadcast, PresenceEvent, Subscription};
use crate::hub::HubConfig;
use crate::presence::{PeerPresence, PresenceTracker, Selection, SessionId};
use crate::registry::ConnectionId;
use crate::storage::VersionStore;

/// Content and version handed to a new subscriber as its baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPoint {
    pub document: Uuid,
    pub title: String,
    pub content: String,
    pub version: u64,
    pub sessions: Vec<PeerPresence>,
}

/// Result of a successful subscribe.
#[derive(Debug)]
pub struct Subscribed {
    pub session: SessionId,
    pub sync: SyncPoint,
    pub subscription: Subscription,
}

/// Explicit acknowledgment of an admitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub document: Uuid,
    pub client_seq: u64,
    pub assigned_version: u64,
    /// The operation as admitted, after rebasing and clamping.
    pub edits: Vec<Edit>,
}

/// Document-level management outside of text editing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentAction {
    /// Fails with `Conflict` if the title is no longer `expected_title`.
    Rename { expected_title: String, title: String },
    SetPublic(bool),
    SoftDelete,
}

impl DocumentAction {
    fn required_level(&self) -> PermissionLevel {
        match self {
            DocumentAction::Rename { .. } => PermissionLevel::Edit,
            DocumentAction::SetPublic(_) | DocumentAction::SoftDelete => PermissionLevel::Admin,
        }
    }
}

/// Who is issuing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: Uuid,
    pub connection: ConnectionId,
    pub session: SessionId,
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

pub(crate) enum Command {
    Subscribe {
        user: Uuid,
        connection: ConnectionId,
        reply: Reply<Subscribed>,
    },
    Resync {
        caller: Caller,
        reply: Reply<(SyncPoint, Subscription)>,
    },
    Submit {
        caller: Caller,
        op: Operation,
        reply: Reply<Ack>,
    },
    Presence {
        caller: Caller,
        cursor: usize,
        selection: Selection,
        reply: Reply<()>,
    },
    Touch {
        caller: Caller,
        reply: Reply<()>,
    },
    Leave {
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Sessions {
        user: Uuid,
        reply: Reply<Vec<PeerPresence>>,
    },
    Snapshot {
        user: Uuid,
        reply: Reply<Document>,
    },
    Manage {
        user: Uuid,
        action: DocumentAction,
        reply: Reply<Document>,
    },
    History {
        user: Uuid,
        since: u64,
        reply: Reply<Vec<DocumentVersion>>,
    },
}

/// The actor stopped before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActorGone;

/// Cloneable address of a running actor.
#[derive(Debug, Clone)]
pub struct ActorHandle {
    document: Uuid,
    tx: mpsc::Sender<Command>,
}

impl ActorHandle {
    pub fn document(&self) -> Uuid {
        self.document
    }

    /// Whether the actor has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ActorGone> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| ActorGone)?;
        rx.await.map_err(|_| ActorGone)
    }
}

/// Admitted edits kept in memory for rebasing.
#[derive(Debug, Clone)]
struct HistoryEntry {
    version: u64,
    author: Uuid,
    edits: Vec<Edit>,
}

pub struct DocumentActor {
    doc: Document,
    store: Arc<dyn VersionStore>,
    gate: Arc<dyn PermissionGate>,
    config: HubConfig,
    presence: PresenceTracker,
    group: BroadcastGroup,
    history: VecDeque<HistoryEntry>,
    inbox: mpsc::Receiver<Command>,
    idle_since: Option<Instant>,
}

impl DocumentActor {
    /// Spawn an actor for `doc` on the current runtime.
    pub fn spawn(
        doc: Document,
        store: Arc<dyn VersionStore>,
        gate: Arc<dyn PermissionGate>,
        config: HubConfig,
    ) -> ActorHandle {
        let (tx, inbox) = mpsc::channel(config.inbox_capacity);
        let document = doc.id;
        let actor = DocumentActor {
            presence: PresenceTracker::new(document),
            group: BroadcastGroup::new(document, config.broadcast_capacity),
            history: VecDeque::with_capacity(config.history_window.min(1024)),
            doc,
            store,
            gate,
            config,
            inbox,
            idle_since: None,
        };
        tokio::spawn(actor.run());
        ActorHandle { document, tx }
    }

    async fn run(mut self) {
        log::info!("Document actor started for {} at version {}", self.doc.id, self.doc.version);

        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.inbox.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.sweep();
                    if self.should_evict() {
                        break;
                    }
                }
            }
        }

        // Commands that raced with shutdown are dropped unanswered; callers
        // observe the closed reply channel and retry on a fresh actor.
        self.inbox.close();
        while self.inbox.try_recv().is_ok() {}
        log::info!("Document actor for {} stopped at version {}", self.doc.id, self.doc.version);
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { user, connection, reply } => {
                let _ = reply.send(self.subscribe(user, connection));
            }
            Command::Resync { caller, reply } => {
                let _ = reply.send(self.resync(&caller));
            }
            Command::Submit { caller, op, reply } => {
                let result = self.submit(&caller, op).await;
                if let Err(e) = &result {
                    log::warn!("Rejected operation on {} from {} ({}): {e}", self.doc.id, caller.user, e.kind());
                }
                // The admission stands even if the submitter is gone.
                let _ = reply.send(result);
            }
            Command::Presence { caller, cursor, selection, reply } => {
                let _ = reply.send(self.update_presence(&caller, cursor, selection));
            }
            Command::Touch { caller, reply } => {
                let result = self.authorize(caller.user, PermissionLevel::View).map(|_| {
                    self.ensure_session(&caller);
                });
                let _ = reply.send(result);
            }
            Command::Leave { session, reply } => {
                let _ = reply.send(self.leave(&session));
            }
            Command::Sessions { user, reply } => {
                let result = self
                    .authorize(user, PermissionLevel::View)
                    .map(|()| self.presence.views());
                let _ = reply.send(result);
            }
            Command::Snapshot { user, reply } => {
                let result = self
                    .authorize(user, PermissionLevel::View)
                    .map(|()| self.doc.clone());
                let _ = reply.send(result);
            }
            Command::Manage { user, action, reply } => {
                let _ = reply.send(self.manage(user, action).await);
            }
            Command::History { user, since, reply } => {
                let result = match self.authorize(user, PermissionLevel::View) {
                    Ok(()) => self
                        .store
                        .list_versions_since(self.doc.id, since)
                        .await
                        .map_err(SyncError::from),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Consult the gate. Never cached: every call asks again.
    fn authorize(&self, user: Uuid, needed: PermissionLevel) -> Result<(), SyncError> {
        match access_level(&self.doc, user, self.gate.as_ref()) {
            Some(level) if level >= needed => Ok(()),
            _ => Err(SyncError::Unauthorized),
        }
    }

    fn sync_point(&self) -> SyncPoint {
        SyncPoint {
            document: self.doc.id,
            title: self.doc.title.clone(),
            content: self.doc.content.clone(),
            version: self.doc.version,
            sessions: self.presence.views(),
        }
    }

    fn subscribe(&mut self, user: Uuid, connection: ConnectionId) -> Result<Subscribed, SyncError> {
        self.authorize(user, PermissionLevel::View)?;
        if self.doc.is_deleted() {
            return Err(SyncError::DocumentDeleted);
        }

        let view = self.presence.join(user, connection).view();
        self.group.publish_presence(PresenceEvent::Joined(view.clone()));

        // Captured in the same step as the receivers: nothing can be
        // published in between.
        let sync = self.sync_point();
        let subscription = self.group.subscribe(sync.version);
        log::info!("Session {} of {} subscribed to {} at version {}", view.session, user, self.doc.id, sync.version);

        Ok(Subscribed {
            session: view.session,
            sync,
            subscription,
        })
    }

    fn resync(&mut self, caller: &Caller) -> Result<(SyncPoint, Subscription), SyncError> {
        self.authorize(caller.user, PermissionLevel::View)?;
        if self.doc.is_deleted() {
            return Err(SyncError::DocumentDeleted);
        }
        self.ensure_session(caller);
        let sync = self.sync_point();
        let subscription = self.group.subscribe(sync.version);
        log::debug!("Session {} resynchronized on {} at version {}", caller.session, self.doc.id, sync.version);
        Ok((sync, subscription))
    }

    async fn submit(&mut self, caller: &Caller, mut op: Operation) -> Result<Ack, SyncError> {
        op.author = caller.user;
        op.document = self.doc.id;

        self.authorize(caller.user, PermissionLevel::Edit)?;
        if self.doc.is_deleted() {
            return Err(SyncError::DocumentDeleted);
        }
        op.validate()?;
        if op.base_version > self.doc.version {
            return Err(SyncError::invalid(format!(
                "base version {} is ahead of current version {}",
                op.base_version, self.doc.version
            )));
        }

        let edits = self.rebase(&op).await?;
        let applied = apply(&self.doc.content, &edits);
        let version = self.doc.version + 1;

        let record = DocumentVersion::new(self.doc.id, version, applied.text.clone(), caller.user)
            .with_operations(&applied.edits)?;

        // The only suspension point of an admission.
        if let Err(e) = self.store.append_version(&record).await {
            log::error!(
                "Failed to persist version {version} of {}, keeping version {}: {e}",
                self.doc.id,
                self.doc.version
            );
            return Err(SyncError::internal(e.to_string()));
        }

        // Durable: commit in memory.
        self.doc.content = applied.text;
        self.doc.record_edit(caller.user);
        self.remember(HistoryEntry {
            version,
            author: caller.user,
            edits: applied.edits.clone(),
        });
        self.ensure_session(caller);

        log::debug!(
            "Admitted version {version} of {} from {} (base {}, {} edits)",
            self.doc.id,
            caller.user,
            op.base_version,
            applied.edits.len()
        );

        self.group.publish_operation(OperationBroadcast {
            document: self.doc.id,
            version,
            author: caller.user,
            session: caller.session.clone(),
            client_seq: op.client_seq,
            edits: applied.edits.clone(),
        });

        Ok(Ack {
            document: self.doc.id,
            client_seq: op.client_seq,
            assigned_version: version,
            edits: applied.edits,
        })
    }

    /// Transform `op` past every version admitted after its base.
    async fn rebase(&self, op: &Operation) -> Result<Vec<Edit>, SyncError> {
        if op.base_version == self.doc.version {
            return Ok(op.edits.clone());
        }

        let window_covers = self
            .history
            .front()
            .is_some_and(|first| first.version <= op.base_version + 1);

        let concurrent: Vec<HistoryEntry> = if window_covers {
            self.history
                .iter()
                .filter(|h| h.version > op.base_version)
                .cloned()
                .collect()
        } else {
            log::debug!(
                "Base version {} of {} is outside the history window, reading the store",
                op.base_version,
                self.doc.id
            );
            let versions = self
                .store
                .list_versions_since(self.doc.id, op.base_version)
                .await?;
            versions
                .into_iter()
                .map(|v| -> Result<HistoryEntry, SyncError> {
                    Ok(HistoryEntry {
                        version: v.version,
                        author: v.author,
                        edits: v.decoded_edits()?,
                    })
                })
                .collect::<Result<_, SyncError>>()?
        };

        let expected = self.doc.version - op.base_version;
        if concurrent.len() as u64 != expected {
            return Err(SyncError::internal(format!(
                "history of {} has {} versions after {}, expected {expected}",
                self.doc.id,
                concurrent.len(),
                op.base_version
            )));
        }

        // Bound the edits by the base text first; the transform only places
        // in-range positions consistently.
        let current_len = self.doc.content.chars().count() as isize;
        let base_len = concurrent
            .iter()
            .fold(current_len, |len, entry| len.saturating_sub(length_delta(&entry.edits)));
        let mut edits = clamp_edits(base_len.max(0) as usize, &op.edits);
        for entry in &concurrent {
            let (rebased, _) = transform_edits(&edits, op.author, &entry.edits, entry.author);
            edits = rebased;
        }
        Ok(edits)
    }

    fn remember(&mut self, entry: HistoryEntry) {
        if self.config.history_window == 0 {
            return;
        }
        while self.history.len() >= self.config.history_window {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    /// Refresh a session, re-admitting it if an idle sweep removed it.
    fn ensure_session(&mut self, caller: &Caller) {
        if self.presence.touch(&caller.session) {
            return;
        }
        if let Some(session) =
            self.presence
                .revive(caller.session.clone(), caller.user, caller.connection.clone())
        {
            log::debug!("Session {} rejoined {}", session.id, self.doc.id);
            let view = session.view();
            self.group.publish_presence(PresenceEvent::Joined(view));
        }
    }

    fn update_presence(&mut self, caller: &Caller, cursor: usize, selection: Selection) -> Result<(), SyncError> {
        self.authorize(caller.user, PermissionLevel::View)?;
        self.ensure_session(caller);
        if let Some(session) = self.presence.update_cursor(&caller.session, cursor, selection) {
            let view = session.view();
            log::trace!("Cursor of {} on {} at {cursor}", caller.session, self.doc.id);
            self.group.publish_presence(PresenceEvent::Updated(view));
        }
        Ok(())
    }

    fn leave(&mut self, session: &SessionId) -> bool {
        match self.presence.leave(session) {
            Some(s) => {
                log::info!("Session {} of {} left {}", s.id, s.user, self.doc.id);
                self.group.publish_presence(PresenceEvent::Left {
                    session: s.id,
                    user: s.user,
                });
                true
            }
            None => false,
        }
    }

    async fn manage(&mut self, user: Uuid, action: DocumentAction) -> Result<Document, SyncError> {
        self.authorize(user, action.required_level())?;
        if self.doc.is_deleted() {
            return Err(SyncError::DocumentDeleted);
        }

        let mut next = self.doc.clone();
        match &action {
            DocumentAction::Rename { expected_title, title } => {
                if &next.title != expected_title {
                    return Err(SyncError::Conflict(format!(
                        "title changed to {:?} since it was read as {:?}",
                        next.title, expected_title
                    )));
                }
                next.rename(title.clone());
            }
            DocumentAction::SetPublic(true) => next.make_public(),
            DocumentAction::SetPublic(false) => next.make_private(),
            DocumentAction::SoftDelete => next.soft_delete(),
        }

        if let Err(e) = self.store.put_document(&next).await {
            log::error!("Failed to persist {action:?} on {}: {e}", self.doc.id);
            return Err(SyncError::internal(e.to_string()));
        }
        self.doc = next;
        log::info!("Applied {action:?} to {} by {user}", self.doc.id);
        Ok(self.doc.clone())
    }

    /// Deactivate idle sessions and announce their departure.
    fn sweep(&mut self) {
        let removed = self
            .presence
            .sweep_idle(Instant::now(), self.config.idle_timeout);
        if removed.is_empty() {
            return;
        }
        log::info!("Removed {} idle sessions from {}", removed.len(), self.doc.id);
        for session in removed {
            self.group.publish_presence(PresenceEvent::Left {
                session: session.id,
                user: session.user,
            });
        }
    }

    fn should_evict(&mut self) -> bool {
        if !self.presence.is_empty() || self.group.receiver_count() > 0 {
            self.idle_since = None;
            return false;
        }
        let now = Instant::now();
        let since = *self.idle_since.get_or_insert(now);
        now.duration_since(since) >= self.config.eviction_grace
    }
}
