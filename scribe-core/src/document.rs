//! The document record and its lifecycle.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_secs;

/// Whether a document is live or soft-deleted.
///
/// A deleted document keeps its content for audit but is absent from
/// listings and rejects every admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    Deleted { at: u64 },
}

/// A markdown document and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub owner: Uuid,
    /// Starts at 0; every admitted operation bumps it by exactly one.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_edited_by: Option<Uuid>,
    pub tags: Vec<String>,
    pub is_public: bool,
    pub share_token: Option<String>,
    pub lifecycle: Lifecycle,
}

impl Document {
    pub fn new(title: impl Into<String>, content: impl Into<String>, owner: Uuid) -> Self {
        let now = now_secs();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            content: content.into(),
            owner,
            version: 0,
            created_at: now,
            updated_at: now,
            last_edited_by: None,
            tags: Vec::new(),
            is_public: false,
            share_token: None,
            lifecycle: Lifecycle::Active,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Deleted { .. })
    }

    /// Mark the document deleted. Deleting twice keeps the first timestamp.
    pub fn soft_delete(&mut self) {
        if !self.is_deleted() {
            let now = now_secs();
            self.lifecycle = Lifecycle::Deleted { at: now };
            self.updated_at = now;
        }
    }

    /// Replace the share token with a fresh random one.
    pub fn generate_share_token(&mut self) -> &str {
        self.share_token.insert(Uuid::new_v4().simple().to_string())
    }

    pub fn make_public(&mut self) {
        self.is_public = true;
        if self.share_token.is_none() {
            self.generate_share_token();
        }
        self.updated_at = now_secs();
    }

    pub fn make_private(&mut self) {
        self.is_public = false;
        self.updated_at = now_secs();
    }

    pub fn rename(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.updated_at = now_secs();
    }

    /// Record that `editor` produced the next version.
    pub fn record_edit(&mut self, editor: Uuid) -> u64 {
        self.version += 1;
        self.last_edited_by = Some(editor);
        self.updated_at = now_secs();
        self.version
    }
}
