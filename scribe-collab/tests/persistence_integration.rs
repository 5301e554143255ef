//! Persistence integration tests.
//!
//! Verifies:
//! - Admitted versions survive closing and reopening the RocksDB store
//! - Version numbering continues after a restart
//! - Stored history passes the integrity audit
//! - Soft-deleted documents stay deleted across restarts
//! - Large documents and multi-document isolation

use scribe_collab::hub::{DocumentHub, HubConfig};
use scribe_collab::server::{ServerConfig, SyncServer};
use scribe_collab::storage::{RocksVersionStore, StoreConfig, StoreError, VersionStore};
use scribe_collab::DocumentAction;
use scribe_core::{verify_history, Document, DocumentVersion, Edit, PermissionTable, SyncError};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &Path) -> Arc<RocksVersionStore> {
    Arc::new(RocksVersionStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn hub_over(store: &Arc<RocksVersionStore>) -> DocumentHub {
    DocumentHub::new(store.clone(), Arc::new(PermissionTable::new()), HubConfig::default())
}

/// Drop the hub and wait for its actors to release the store, so the
/// database lock is free for the next open.
async fn shut_down(hub: DocumentHub, store: Arc<RocksVersionStore>) {
    drop(hub);
    for _ in 0..200 {
        if Arc::strong_count(&store) == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("document actors did not release the store");
}

/// Submit `texts` one after another at the end of the document.
async fn type_lines(hub: &DocumentHub, owner: Uuid, doc: Uuid, texts: &[&str]) -> u64 {
    let conn = hub.connect(owner);
    let sub = hub.subscribe(&conn, doc).await.unwrap();
    let mut version = sub.sync.version;
    let mut len = sub.sync.content.chars().count();
    for (i, text) in texts.iter().enumerate() {
        let ack = hub
            .submit(&conn, doc, version, i as u64 + 1, vec![Edit::insert(len, *text)])
            .await
            .unwrap();
        version = ack.assigned_version;
        len += text.chars().count();
    }
    hub.disconnect(&conn).await;
    version
}

// ─── Crash Recovery ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_versions_survive_restart() {
    let dir = tempdir().unwrap();
    let owner = Uuid::new_v4();

    let doc_id = {
        let store = open_store(dir.path());
        let hub = hub_over(&store);
        let doc = hub.create_document(owner, "Journal", "").await.unwrap();
        let version = type_lines(&hub, owner, doc.id, &["Day one. ", "Day two. ", "Day three."]).await;
        assert_eq!(version, 3);
        shut_down(hub, store).await;
        doc.id
    };

    let store = open_store(dir.path());
    let snapshot = store.load_snapshot(doc_id).await.unwrap();
    assert_eq!(snapshot.content, "Day one. Day two. Day three.");
    assert_eq!(snapshot.version, 3);

    let versions = store.list_versions_since(doc_id, 0).await.unwrap();
    assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(versions.iter().all(|v| v.author == owner && v.verify()));
}

#[tokio::test]
async fn test_numbering_continues_after_restart() {
    let dir = tempdir().unwrap();
    let owner = Uuid::new_v4();

    let store = open_store(dir.path());
    let hub = hub_over(&store);
    let doc = hub.create_document(owner, "Log", "").await.unwrap();
    type_lines(&hub, owner, doc.id, &["a", "b"]).await;
    shut_down(hub, store).await;

    let store = open_store(dir.path());
    let hub = hub_over(&store);
    let version = type_lines(&hub, owner, doc.id, &["c"]).await;
    assert_eq!(version, 3);

    let report = hub.verify_history(owner, doc.id).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.issues);
    assert_eq!(report.checked, 3);
    assert_eq!(hub.snapshot(owner, doc.id).await.unwrap().content, "abc");
}

#[tokio::test]
async fn test_stored_history_replays_exactly() {
    let dir = tempdir().unwrap();
    let owner = Uuid::new_v4();
    let store = open_store(dir.path());
    let hub = hub_over(&store);
    let doc = hub.create_document(owner, "Notes", "hello").await.unwrap();

    // Two editors on the same base: the second one is rebased.
    let a = hub.connect(owner);
    let b = hub.connect(owner);
    hub.subscribe(&a, doc.id).await.unwrap();
    hub.subscribe(&b, doc.id).await.unwrap();
    hub.submit(&a, doc.id, 0, 1, vec![Edit::insert(0, "X")]).await.unwrap();
    hub.submit(&b, doc.id, 0, 1, vec![Edit::insert(5, "Y")]).await.unwrap();
    hub.submit(&a, doc.id, 1, 2, vec![Edit::delete(1, 5)]).await.unwrap();

    let versions = store.list_versions_since(doc.id, 0).await.unwrap();
    let report = verify_history(&versions);
    assert!(report.is_clean(), "{:?}", report.issues);
    assert_eq!(versions[1].decoded_edits().unwrap(), vec![Edit::insert(6, "Y")]);
    assert_eq!(versions.last().unwrap().content, "XY");
}

#[tokio::test]
async fn test_soft_delete_survives_restart() {
    let dir = tempdir().unwrap();
    let owner = Uuid::new_v4();

    let store = open_store(dir.path());
    let hub = hub_over(&store);
    let keep = hub.create_document(owner, "keep", "").await.unwrap();
    let gone = hub.create_document(owner, "gone", "content stays").await.unwrap();
    hub.manage(owner, gone.id, DocumentAction::SoftDelete).await.unwrap();
    shut_down(hub, store).await;

    let store = open_store(dir.path());
    assert_eq!(store.list_documents().await.unwrap(), vec![keep.id]);
    let deleted = store.load_document(gone.id).await.unwrap();
    assert!(deleted.is_deleted());
    assert_eq!(deleted.content, "content stays");

    let hub = hub_over(&store);
    let conn = hub.connect(owner);
    assert_eq!(
        hub.subscribe(&conn, gone.id).await.unwrap_err(),
        SyncError::DocumentDeleted
    );
}

// ─── Store Guarantees ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_append_is_all_or_nothing() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let author = Uuid::new_v4();
    let doc = Document::new("t", "", author);
    store.put_document(&doc).await.unwrap();

    store
        .append_version(&DocumentVersion::new(doc.id, 1, "one", author))
        .await
        .unwrap();
    let err = store
        .append_version(&DocumentVersion::new(doc.id, 1, "again", author))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::VersionGap { expected: 2, got: 1 });

    let snapshot = store.load_snapshot(doc.id).await.unwrap();
    assert_eq!((snapshot.content.as_str(), snapshot.version), ("one", 1));
    assert_eq!(store.list_versions_since(doc.id, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_multi_document_isolation() {
    let dir = tempdir().unwrap();
    let owner = Uuid::new_v4();
    let store = open_store(dir.path());
    let hub = hub_over(&store);

    let mut ids = Vec::new();
    for i in 0..5 {
        let doc = hub.create_document(owner, format!("doc {i}"), "").await.unwrap();
        let line = format!("only in {i}");
        type_lines(&hub, owner, doc.id, &[line.as_str()]).await;
        ids.push(doc.id);
    }

    for (i, id) in ids.iter().enumerate() {
        let versions = store.list_versions_since(*id, 0).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].content, format!("only in {i}"));
    }
    let mut listed = store.list_documents().await.unwrap();
    listed.sort();
    ids.sort();
    assert_eq!(listed, ids);
}

#[tokio::test]
async fn test_large_document_persistence() {
    let dir = tempdir().unwrap();
    let author = Uuid::new_v4();
    let content = "The quick brown fox jumps over the lazy dog. ".repeat(25_000);

    let id = {
        let store = open_store(dir.path());
        let doc = Document::new("big", "", author);
        store.put_document(&doc).await.unwrap();
        let record = DocumentVersion::new(doc.id, 1, content.as_str(), author)
            .with_operations(&[Edit::insert(0, content.as_str())])
            .unwrap();
        store.append_version(&record).await.unwrap();
        doc.id
    };

    let store = open_store(dir.path());
    let versions = store.list_versions_since(id, 0).await.unwrap();
    assert_eq!(versions[0].content.len(), content.len());
    assert!(versions[0].verify());
}

// ─── Server Wiring ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_persistence_config() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        storage_path: Some(dir.path().join("db")),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config, Arc::new(PermissionTable::new())).unwrap();
    let owner = Uuid::new_v4();
    let doc = server.hub().create_document(owner, "t", "").await.unwrap();
    let version = type_lines(server.hub(), owner, doc.id, &["persisted"]).await;
    assert_eq!(version, 1);
    assert!(dir.path().join("db").exists());
}

#[tokio::test]
async fn test_server_in_memory_mode() {
    let server = SyncServer::new(ServerConfig::default(), Arc::new(PermissionTable::new())).unwrap();
    assert!(server.hub().store().list_documents().await.unwrap().is_empty());
}
