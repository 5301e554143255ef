//! Error taxonomy shared by every layer of the synchronization core.
//!
//! Everything except [`SyncError::Internal`] is recovered at the admission
//! boundary and reported only to the session that caused it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by document admission and management.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Permission denied, missing or expired.
    #[error("unauthorized access")]
    Unauthorized,

    /// The target document is soft-deleted.
    #[error("document has been deleted")]
    DocumentDeleted,

    /// Malformed operation or a base version ahead of the document.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Application-level conflict outside OT (e.g. concurrent rename).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The document does not exist.
    #[error("document not found: {0}")]
    NotFound(Uuid),

    /// Persistence or other internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The wire-level kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::DocumentDeleted => ErrorKind::DocumentDeleted,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Serializable error classification sent back to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Unauthorized,
    DocumentDeleted,
    InvalidInput,
    Conflict,
    NotFound,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unauthorized => "unauthorized",
            Self::DocumentDeleted => "document_deleted",
            Self::InvalidInput => "invalid_input",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}
