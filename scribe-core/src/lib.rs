//! Data model and pure algorithms for collaborative markdown editing.
//!
//! Everything here is synchronous and I/O free:
//! - [`operation`]: edits, operations and sequential application
//! - [`transform`]: operational transformation of concurrent edits
//! - [`version`]: immutable version records, digests and history audit
//! - [`document`]: the document record and its lifecycle
//! - [`permission`]: permission levels and the admission gate contract
//! - [`error`]: the error taxonomy shared by every layer

pub mod document;
pub mod error;
pub mod operation;
pub mod permission;
pub mod transform;
pub mod version;

pub use document::{Document, Lifecycle};
pub use error::{ErrorKind, SyncError};
pub use operation::{apply, clamp_edits, length_delta, Applied, Edit, Operation};
pub use permission::{access_level, Permission, PermissionGate, PermissionLevel, PermissionTable};
pub use transform::{transform, transform_edits, transform_pair};
pub use version::{
    digest, verify_history, verify_history_from, DocumentVersion, IntegrityIssue, IntegrityReport,
};

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
