//! Process-wide connection table.
//!
//! Maps a transport connection to its user and to the session it holds on
//! each subscribed document. This is the only table shared across document
//! actors; it holds no document state, only what is needed to route a
//! disconnect to the right actors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::SessionId;

/// Opaque transport connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct Connection {
    user: Uuid,
    documents: HashMap<Uuid, SessionId>,
}

/// What a closed connection was holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub user: Uuid,
    pub bindings: Vec<(Uuid, SessionId)>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new connection for `user`.
    pub fn connect(&self, user: Uuid) -> ConnectionId {
        let id = ConnectionId::new();
        self.lock().insert(
            id.clone(),
            Connection {
                user,
                documents: HashMap::new(),
            },
        );
        id
    }

    /// The user behind a connection.
    pub fn resolve(&self, connection: &ConnectionId) -> Option<Uuid> {
        self.lock().get(connection).map(|c| c.user)
    }

    /// The session a connection holds on `document`.
    pub fn session(&self, connection: &ConnectionId, document: Uuid) -> Option<SessionId> {
        self.lock()
            .get(connection)
            .and_then(|c| c.documents.get(&document).cloned())
    }

    /// Record a subscription. Fails if the connection is gone.
    pub fn bind(&self, connection: &ConnectionId, document: Uuid, session: SessionId) -> bool {
        match self.lock().get_mut(connection) {
            Some(c) => {
                c.documents.insert(document, session);
                true
            }
            None => false,
        }
    }

    pub fn unbind(&self, connection: &ConnectionId, document: Uuid) -> Option<SessionId> {
        self.lock()
            .get_mut(connection)
            .and_then(|c| c.documents.remove(&document))
    }

    /// Forget a connection, returning its bindings so the caller can end
    /// the sessions.
    pub fn disconnect(&self, connection: &ConnectionId) -> Option<Disconnected> {
        let conn = self.lock().remove(connection)?;
        Some(Disconnected {
            user: conn.user,
            bindings: conn.documents.into_iter().collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
