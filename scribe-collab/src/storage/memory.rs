//! In-process version store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use scribe_core::{Document, DocumentVersion};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{advance, StoreError, VersionStore};

#[derive(Debug)]
struct Entry {
    document: Document,
    versions: Vec<DocumentVersion>,
}

/// Keeps every document and version in memory.
///
/// `fail_next_appends` makes the next `n` appends fail, for exercising
/// rollback paths.
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    entries: RwLock<HashMap<Uuid, Entry>>,
    failures: AtomicUsize,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_appends(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn put_document(&self, doc: &Document) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&doc.id) {
            Some(entry) => entry.document = doc.clone(),
            None => {
                entries.insert(
                    doc.id,
                    Entry {
                        document: doc.clone(),
                        versions: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn load_document(&self, id: Uuid) -> Result<Document, StoreError> {
        let entries = self.entries.read().await;
        entries
            .get(&id)
            .map(|e| e.document.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn append_version(&self, version: &DocumentVersion) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Backend("injected append failure".into()));
        }
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&version.document)
            .ok_or(StoreError::NotFound(version.document))?;

        let mut next = entry.document.clone();
        advance(&mut next, version)?;
        entry.document = next;
        entry.versions.push(version.clone());
        Ok(())
    }

    async fn list_versions_since(&self, id: Uuid, since: u64) -> Result<Vec<DocumentVersion>, StoreError> {
        let entries = self.entries.read().await;
        let entry = entries.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(entry
            .versions
            .iter()
            .filter(|v| v.version > since)
            .cloned()
            .collect())
    }

    async fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| !e.document.is_deleted())
            .map(|e| e.document.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_list() {
        let store = MemoryVersionStore::new();
        let author = Uuid::new_v4();
        let doc = Document::new("t", "", author);
        store.put_document(&doc).await.unwrap();

        for (v, text) in [(1, "a"), (2, "ab"), (3, "abc")] {
            store
                .append_version(&DocumentVersion::new(doc.id, v, text, author))
                .await
                .unwrap();
        }

        let snapshot = store.load_snapshot(doc.id).await.unwrap();
        assert_eq!(snapshot.content, "abc");
        assert_eq!(snapshot.version, 3);

        let since = store.list_versions_since(doc.id, 1).await.unwrap();
        let numbers: Vec<u64> = since.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_gap_is_rejected_without_side_effects() {
        let store = MemoryVersionStore::new();
        let author = Uuid::new_v4();
        let doc = Document::new("t", "base", author);
        store.put_document(&doc).await.unwrap();

        let err = store
            .append_version(&DocumentVersion::new(doc.id, 2, "x", author))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::VersionGap { expected: 1, got: 2 });
        assert_eq!(store.load_snapshot(doc.id).await.unwrap().content, "base");
        assert!(store.list_versions_since(doc.id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryVersionStore::new();
        let author = Uuid::new_v4();
        let doc = Document::new("t", "", author);
        store.put_document(&doc).await.unwrap();
        store.fail_next_appends(1);

        let v1 = DocumentVersion::new(doc.id, 1, "a", author);
        assert!(matches!(store.append_version(&v1).await, Err(StoreError::Backend(_))));
        store.append_version(&v1).await.unwrap();
        assert_eq!(store.load_snapshot(doc.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_deleted_documents_are_not_listed() {
        let store = MemoryVersionStore::new();
        let owner = Uuid::new_v4();
        let kept = Document::new("kept", "", owner);
        let mut gone = Document::new("gone", "", owner);
        store.put_document(&kept).await.unwrap();
        store.put_document(&gone).await.unwrap();

        gone.soft_delete();
        store.put_document(&gone).await.unwrap();

        assert_eq!(store.list_documents().await.unwrap(), vec![kept.id]);
        assert!(store.load_document(gone.id).await.unwrap().is_deleted());
    }
}
