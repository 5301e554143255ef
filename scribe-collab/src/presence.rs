//! Per-document session presence: cursors, selections, liveness.
//!
//! A [`PresenceTracker`] is owned by exactly one document actor and is
//! never shared. Cursor updates are last-writer-wins in server receipt
//! order; client clocks play no part.
//!
//! ```text
//! subscribe ──► join ──► update_cursor / touch ──► leave
//!                               │
//!                               └── idle > timeout ──► sweep_idle (removed)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use scribe_core::now_secs;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::registry::ConnectionId;

/// Display colours assigned to users.
pub const PALETTE: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8",
    "#F7DC6F", "#BB8FCE", "#85C1E2", "#F8B88B", "#AAB7B8",
];

/// Cursor colour as a `#RRGGBB` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorColor(String);

impl CursorColor {
    /// Stable colour for a user: the same user gets the same colour on
    /// every document and every server.
    pub fn for_user(user: Uuid) -> Self {
        let index = user.as_bytes()[0] as usize % PALETTE.len();
        Self(PALETTE[index].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CursorColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque session identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selected character range, `start <= end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(a: usize, b: usize) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One user's presence on one document.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user: Uuid,
    pub document: Uuid,
    pub connection: ConnectionId,
    pub cursor: usize,
    pub selection: Selection,
    pub color: CursorColor,
    pub last_activity: Instant,
    pub created_at: u64,
    pub active: bool,
    /// Bumped on every cursor/selection change.
    pub revision: u64,
}

impl Session {
    fn new(id: SessionId, user: Uuid, document: Uuid, connection: ConnectionId) -> Self {
        Self {
            id,
            user,
            document,
            connection,
            cursor: 0,
            selection: Selection::default(),
            color: CursorColor::for_user(user),
            last_activity: Instant::now(),
            created_at: now_secs(),
            active: true,
            revision: 0,
        }
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    /// What other subscribers get to see.
    pub fn view(&self) -> PeerPresence {
        PeerPresence {
            session: self.id.clone(),
            user: self.user,
            color: self.color.clone(),
            cursor: self.cursor,
            selection: self.selection,
        }
    }
}

/// Public, serializable view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub session: SessionId,
    pub user: Uuid,
    pub color: CursorColor,
    pub cursor: usize,
    pub selection: Selection,
}

/// Active sessions of one document.
#[derive(Debug)]
pub struct PresenceTracker {
    document: Uuid,
    sessions: HashMap<SessionId, Session>,
}

impl PresenceTracker {
    pub fn new(document: Uuid) -> Self {
        Self {
            document,
            sessions: HashMap::new(),
        }
    }

    /// Start a new session.
    pub fn join(&mut self, user: Uuid, connection: ConnectionId) -> &Session {
        self.insert(SessionId::new(), user, connection)
    }

    /// Re-admit a session removed by an idle sweep, keeping its id.
    ///
    /// Returns `None` when the session is still present.
    pub fn revive(&mut self, id: SessionId, user: Uuid, connection: ConnectionId) -> Option<&Session> {
        if self.sessions.contains_key(&id) {
            return None;
        }
        Some(self.insert(id, user, connection))
    }

    fn insert(&mut self, id: SessionId, user: Uuid, connection: ConnectionId) -> &Session {
        let session = Session::new(id.clone(), user, self.document, connection);
        self.sessions.entry(id).or_insert(session)
    }

    /// Record a cursor/selection change. Returns the updated session.
    pub fn update_cursor(&mut self, id: &SessionId, cursor: usize, selection: Selection) -> Option<&Session> {
        let session = self.sessions.get_mut(id)?;
        session.cursor = cursor;
        session.selection = selection;
        session.last_activity = Instant::now();
        session.revision += 1;
        Some(session)
    }

    /// Mark activity without changing the cursor.
    pub fn touch(&mut self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Deactivate and remove a session.
    pub fn leave(&mut self, id: &SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(id)?;
        session.active = false;
        Some(session)
    }

    /// Remove every session idle for strictly longer than `timeout`.
    pub fn sweep_idle(&mut self, now: Instant, timeout: Duration) -> Vec<Session> {
        let stale: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_idle(now, timeout))
            .map(|s| s.id.clone())
            .collect();

        stale.iter().filter_map(|id| self.leave(id)).collect()
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Active sessions, oldest first.
    pub fn sessions(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        sessions
    }

    pub fn views(&self) -> Vec<PeerPresence> {
        self.sessions().into_iter().map(Session::view).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
