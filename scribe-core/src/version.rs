//! Immutable version records and history audit.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::error::SyncError;
use crate::now_secs;
use crate::operation::{apply, decode_edits, encode_edits, Edit};

/// Lower-case hex SHA-256 of `content`.
pub fn digest(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// A durable snapshot produced by one admitted operation.
///
/// Version numbers for a document run 1, 2, 3... with no gaps. Version 0 is
/// the created state and is never stored as a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub document: Uuid,
    pub version: u64,
    pub content: String,
    pub author: Uuid,
    /// JSON-encoded edit batch that produced this version.
    pub operations: Option<String>,
    pub digest: String,
    pub created_at: u64,
    pub message: Option<String>,
}

impl DocumentVersion {
    pub fn new(document: Uuid, version: u64, content: impl Into<String>, author: Uuid) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            document,
            version,
            digest: digest(&content),
            content,
            author,
            operations: None,
            created_at: now_secs(),
            message: None,
        }
    }

    pub fn with_operations(mut self, edits: &[Edit]) -> Result<Self, SyncError> {
        self.operations = Some(encode_edits(edits)?);
        Ok(self)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Whether the stored digest matches the content.
    pub fn verify(&self) -> bool {
        digest(&self.content) == self.digest
    }

    /// The recorded edit batch, empty when none was stored.
    pub fn decoded_edits(&self) -> Result<Vec<Edit>, SyncError> {
        match &self.operations {
            Some(encoded) => decode_edits(encoded),
            None => Ok(Vec::new()),
        }
    }
}

/// A single audit finding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    #[error("version {version}: digest mismatch (stored {stored}, computed {computed})")]
    DigestMismatch {
        version: u64,
        stored: String,
        computed: String,
    },

    #[error("expected version {expected}, found {found}")]
    Gap { expected: u64, found: u64 },

    #[error("version {version}: recorded edits do not reproduce its content")]
    ReplayMismatch { version: u64 },

    #[error("version {version}: operation batch is unreadable")]
    UnreadableOperations { version: u64 },

    #[error("history ends at version {stored}, document is at version {current}")]
    Truncated { stored: u64, current: u64 },
}

/// Outcome of [`verify_history`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Audit the complete history of one document, starting at version 1.
pub fn verify_history(versions: &[DocumentVersion]) -> IntegrityReport {
    verify_history_from(1, versions)
}

/// Audit an ascending run of versions of one document that must start at
/// version `first`.
///
/// Checks every digest, that numbering has no gaps, and that each version's
/// recorded edits replayed on its predecessor's content reproduce its own
/// content. The first record has no predecessor in the run and is only
/// checked against its digest.
pub fn verify_history_from(first: u64, versions: &[DocumentVersion]) -> IntegrityReport {
    let mut report = IntegrityReport {
        checked: versions.len(),
        issues: Vec::new(),
    };

    let mut expected = first;
    let mut prev: Option<&DocumentVersion> = None;
    for v in versions {
        if !v.verify() {
            report.issues.push(IntegrityIssue::DigestMismatch {
                version: v.version,
                stored: v.digest.clone(),
                computed: digest(&v.content),
            });
        }

        if v.version != expected {
            report.issues.push(IntegrityIssue::Gap {
                expected,
                found: v.version,
            });
        } else if let Some(p) = prev.filter(|_| v.operations.is_some()) {
            match v.decoded_edits() {
                Ok(edits) => {
                    if apply(&p.content, &edits).text != v.content {
                        report.issues.push(IntegrityIssue::ReplayMismatch { version: v.version });
                    }
                }
                Err(_) => {
                    report
                        .issues
                        .push(IntegrityIssue::UnreadableOperations { version: v.version });
                }
            }
        }
        expected = v.version.saturating_add(1);
        prev = Some(v);
    }

    report
}
