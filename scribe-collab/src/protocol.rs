//! Binary wire protocol between editors and the sync server.
//!
//! Every WebSocket binary frame carries exactly one message, bincode-encoded
//! (serde mode, standard config):
//! ```text
//! client ──► server   Hello · Subscribe · SubmitOperation · PresenceUpdate · Unsubscribe · Ping
//! server ──► client   Welcome · Synced · Ack · Error · BroadcastOperation · PresenceUpdate · PresenceLeave · Pong
//! ```
//!
//! Positions and lengths count characters, not bytes.

use scribe_core::{Edit, ErrorKind, SyncError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::actor::{Ack, SyncPoint};
use crate::broadcast::{OperationBroadcast, PresenceEvent};
use crate::presence::{PeerPresence, Selection, SessionId};
use crate::registry::ConnectionId;

/// Messages sent by an editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message on a connection. Trusted as-is.
    Hello { user: Uuid },
    Subscribe { document: Uuid },
    SubmitOperation {
        document: Uuid,
        base_version: u64,
        client_seq: u64,
        edits: Vec<Edit>,
    },
    PresenceUpdate {
        document: Uuid,
        cursor: usize,
        selection_start: usize,
        selection_end: usize,
    },
    Unsubscribe { document: Uuid },
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome { connection: ConnectionId },
    /// Synchronization point: broadcasts that follow continue from `version`.
    Synced {
        document: Uuid,
        session: SessionId,
        content: String,
        version: u64,
        sessions: Vec<PeerPresence>,
    },
    Ack {
        document: Uuid,
        client_seq: u64,
        assigned_version: u64,
    },
    /// Sent only to the session whose request failed.
    Error {
        document: Option<Uuid>,
        client_seq: Option<u64>,
        kind: ErrorKind,
        message: String,
    },
    BroadcastOperation {
        document: Uuid,
        version: u64,
        author: Uuid,
        session: SessionId,
        client_seq: u64,
        edits: Vec<Edit>,
    },
    PresenceUpdate {
        document: Uuid,
        session: SessionId,
        user: Uuid,
        color: String,
        cursor: usize,
        selection_start: usize,
        selection_end: usize,
    },
    PresenceLeave { document: Uuid, session: SessionId },
    Pong,
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn presence(document: Uuid, cursor: usize, selection: Selection) -> Self {
        ClientMessage::PresenceUpdate {
            document,
            cursor,
            selection_start: selection.start,
            selection_end: selection.end,
        }
    }

    /// Document the message targets, if any.
    pub fn document(&self) -> Option<Uuid> {
        match self {
            ClientMessage::Subscribe { document }
            | ClientMessage::SubmitOperation { document, .. }
            | ClientMessage::PresenceUpdate { document, .. }
            | ClientMessage::Unsubscribe { document } => Some(*document),
            ClientMessage::Hello { .. } | ClientMessage::Ping => None,
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn synced(session: SessionId, sync: SyncPoint) -> Self {
        ServerMessage::Synced {
            document: sync.document,
            session,
            content: sync.content,
            version: sync.version,
            sessions: sync.sessions,
        }
    }

    pub fn ack(ack: &Ack) -> Self {
        ServerMessage::Ack {
            document: ack.document,
            client_seq: ack.client_seq,
            assigned_version: ack.assigned_version,
        }
    }

    pub fn error(document: Option<Uuid>, client_seq: Option<u64>, err: &SyncError) -> Self {
        ServerMessage::Error {
            document,
            client_seq,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn operation(op: &OperationBroadcast) -> Self {
        ServerMessage::BroadcastOperation {
            document: op.document,
            version: op.version,
            author: op.author,
            session: op.session.clone(),
            client_seq: op.client_seq,
            edits: op.edits.clone(),
        }
    }

    pub fn presence(document: Uuid, event: &PresenceEvent) -> Self {
        match event {
            PresenceEvent::Joined(peer) | PresenceEvent::Updated(peer) => ServerMessage::PresenceUpdate {
                document,
                session: peer.session.clone(),
                user: peer.user,
                color: peer.color.to_string(),
                cursor: peer.cursor,
                selection_start: peer.selection.start,
                selection_end: peer.selection.end,
            },
            PresenceEvent::Left { session, .. } => ServerMessage::PresenceLeave {
                document,
                session: session.clone(),
            },
        }
    }
}
