//! Durable version log consumed by the document actors.
//!
//! ```text
//! ┌───────────────┐  append_version   ┌──────────────────────────────────┐
//! │ DocumentActor │ ────────────────► │ VersionStore                     │
//! │ (one per doc) │ ◄──────────────── │  MemoryVersionStore (tests)      │
//! └───────────────┘  load / list      │  RocksVersionStore  (durable)    │
//!                                     └──────────────────────────────────┘
//! ```
//!
//! An append is all-or-nothing: the version record and the advanced
//! document snapshot become visible together or not at all.

pub mod memory;
pub mod rocks;

pub use memory::MemoryVersionStore;
pub use rocks::{RocksVersionStore, StoreConfig};

use async_trait::async_trait;
use scribe_core::{Document, DocumentVersion, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("document not found: {0}")]
    NotFound(Uuid),

    /// The appended version does not directly follow the stored one.
    #[error("version gap: expected {expected}, got {got}")]
    VersionGap { expected: u64, got: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::NotFound(id),
            other => SyncError::Internal(other.to_string()),
        }
    }
}

/// Content and version of a document at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content: String,
    pub version: u64,
}

/// Append-only, per-document version log.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Create a document or update its metadata (title, visibility, lifecycle).
    async fn put_document(&self, doc: &Document) -> Result<(), StoreError>;

    /// Latest durable state of a document, content included.
    async fn load_document(&self, id: Uuid) -> Result<Document, StoreError>;

    /// Append the next version and advance the stored document with it.
    ///
    /// Fails with [`StoreError::VersionGap`] unless `version` is exactly one
    /// past the stored document version.
    async fn append_version(&self, version: &DocumentVersion) -> Result<(), StoreError>;

    async fn load_snapshot(&self, id: Uuid) -> Result<Snapshot, StoreError> {
        let doc = self.load_document(id).await?;
        Ok(Snapshot {
            content: doc.content,
            version: doc.version,
        })
    }

    /// Versions strictly greater than `since`, ascending.
    async fn list_versions_since(&self, id: Uuid, since: u64) -> Result<Vec<DocumentVersion>, StoreError>;

    /// Ids of all documents that are not soft-deleted.
    async fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Apply a version record to the document it belongs to.
pub(crate) fn advance(doc: &mut Document, version: &DocumentVersion) -> Result<(), StoreError> {
    let expected = doc.version + 1;
    if version.version != expected {
        return Err(StoreError::VersionGap {
            expected,
            got: version.version,
        });
    }
    doc.content.clone_from(&version.content);
    doc.record_edit(version.author);
    Ok(())
}

/// bincode, then LZ4 with a size prefix.
pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

pub(crate) fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}
