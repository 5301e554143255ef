//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full admission and fan-out pipeline.

use futures_util::{SinkExt, StreamExt};
use scribe_collab::client::{ClientDocument, ConnectionState, SyncClient, SyncEvent};
use scribe_collab::hub::{DocumentHub, HubConfig};
use scribe_collab::protocol::{ClientMessage, ServerMessage};
use scribe_collab::server::{ServerConfig, SyncServer};
use scribe_collab::storage::MemoryVersionStore;
use scribe_core::{Edit, ErrorKind, PermissionLevel, PermissionTable};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

struct TestServer {
    url: String,
    hub: Arc<DocumentHub>,
    gate: Arc<PermissionTable>,
}

/// Start a server on a free port.
async fn start_test_server() -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let gate = Arc::new(PermissionTable::new());
    let hub = Arc::new(DocumentHub::new(
        Arc::new(MemoryVersionStore::new()),
        gate.clone(),
        HubConfig::default(),
    ));
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = SyncServer::with_hub(config, hub.clone());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        hub,
        gate,
    }
}

/// Next server message, skipping connection events.
async fn next_message(events: &mut Receiver<SyncEvent>) -> ServerMessage {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("event channel closed");
        match event {
            SyncEvent::Message(msg) => return msg,
            SyncEvent::Connected => continue,
            SyncEvent::Disconnected => panic!("disconnected while waiting for a message"),
        }
    }
}

/// Connect, wait for `Welcome`, subscribe and wait for `Synced`.
async fn join(url: &str, user: Uuid, document: Uuid) -> (SyncClient, Receiver<SyncEvent>, ClientDocument) {
    let mut client = SyncClient::new(user, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match next_message(&mut events).await {
        ServerMessage::Welcome { .. } => {}
        other => panic!("expected Welcome, got {other:?}"),
    }

    client.subscribe(document).await.unwrap();
    let mut doc = ClientDocument::new(document, user);
    loop {
        if let ServerMessage::Synced { session, content, version, .. } = next_message(&mut events).await {
            doc.sync(session, content, version);
            break;
        }
    }
    (client, events, doc)
}

/// Apply one server message to a replica.
fn feed(doc: &mut ClientDocument, msg: &ServerMessage) {
    match msg {
        ServerMessage::BroadcastOperation {
            document,
            version,
            author,
            session,
            client_seq,
            edits,
        } if *document == doc.document() => {
            doc.receive(*version, *author, session, *client_seq, edits);
        }
        ServerMessage::Synced {
            document,
            session,
            content,
            version,
            ..
        } if *document == doc.document() => {
            doc.sync(session.clone(), content.clone(), *version);
        }
        _ => {}
    }
}

/// Pump messages into `doc`, flushing local edits, until it reaches
/// `version` with nothing pending.
async fn settle(client: &SyncClient, events: &mut Receiver<SyncEvent>, doc: &mut ClientDocument, version: u64) {
    client.flush(doc).await.unwrap();
    while doc.version() < version || doc.has_pending() {
        let msg = next_message(events).await;
        feed(doc, &msg);
        client.flush(doc).await.unwrap();
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server().await;
    let result = tokio_tungstenite::connect_async(server.url.as_str()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_is_welcomed() {
    let server = start_test_server().await;
    let mut client = SyncClient::new(Uuid::new_v4(), &server.url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(SyncEvent::Connected) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert!(matches!(next_message(&mut events).await, ServerMessage::Welcome { .. }));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_request_before_hello_is_unauthorized() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();

    let request = ClientMessage::Subscribe { document: Uuid::new_v4() };
    ws.send(Message::Binary(request.encode().unwrap().into())).await.unwrap();

    let frame = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    match frame {
        Message::Binary(data) => match ServerMessage::decode(&data).unwrap() {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Unauthorized),
            other => panic!("expected Error, got {other:?}"),
        },
        other => panic!("expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_two_clients_converge_on_concurrent_inserts() {
    let server = start_test_server().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let doc = server.hub.create_document(alice, "Greeting", "hello").await.unwrap();
    server.gate.grant(doc.id, bob, PermissionLevel::Edit, alice);

    let (client_a, mut events_a, mut doc_a) = join(&server.url, alice, doc.id).await;
    let (client_b, mut events_b, mut doc_b) = join(&server.url, bob, doc.id).await;

    // Both edit the same base version before seeing each other.
    doc_a.local_edit(Edit::insert(0, "X")).unwrap();
    doc_b.local_edit(Edit::insert(5, "Y")).unwrap();
    client_a.flush(&mut doc_a).await.unwrap();
    client_b.flush(&mut doc_b).await.unwrap();

    settle(&client_a, &mut events_a, &mut doc_a, 2).await;
    settle(&client_b, &mut events_b, &mut doc_b, 2).await;

    assert_eq!(doc_a.text(), "XhelloY");
    assert_eq!(doc_b.text(), "XhelloY");
    assert_eq!(server.hub.snapshot(alice, doc.id).await.unwrap().content, "XhelloY");
}

#[tokio::test]
async fn test_interleaved_typing_converges() {
    let server = start_test_server().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let doc = server.hub.create_document(alice, "Draft", "# Title\n").await.unwrap();
    server.gate.grant(doc.id, bob, PermissionLevel::Edit, alice);

    let (client_a, mut events_a, mut doc_a) = join(&server.url, alice, doc.id).await;
    let (client_b, mut events_b, mut doc_b) = join(&server.url, bob, doc.id).await;

    for i in 0..20 {
        let a_pos = doc_a.text().chars().count();
        doc_a.local_edit(Edit::insert(a_pos, "a")).unwrap();
        doc_b.local_edit(Edit::insert(i % 3, "b")).unwrap();
        client_a.flush(&mut doc_a).await.unwrap();
        client_b.flush(&mut doc_b).await.unwrap();
    }

    // Buffered edits are batched, so the final version is at most 40.
    let a = async {
        while doc_a.has_pending() {
            let msg = next_message(&mut events_a).await;
            feed(&mut doc_a, &msg);
            client_a.flush(&mut doc_a).await.unwrap();
        }
    };
    let b = async {
        while doc_b.has_pending() {
            let msg = next_message(&mut events_b).await;
            feed(&mut doc_b, &msg);
            client_b.flush(&mut doc_b).await.unwrap();
        }
    };
    tokio::join!(a, b);

    let authoritative = server.hub.snapshot(alice, doc.id).await.unwrap();
    settle(&client_a, &mut events_a, &mut doc_a, authoritative.version).await;
    settle(&client_b, &mut events_b, &mut doc_b, authoritative.version).await;

    assert_eq!(doc_a.text(), authoritative.content);
    assert_eq!(doc_b.text(), authoritative.content);
    assert_eq!(authoritative.content.matches('a').count(), 20);
    assert_eq!(authoritative.content.matches('b').count(), 20);
}

#[tokio::test]
async fn test_view_only_client_is_rejected() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let viewer = Uuid::new_v4();
    let doc = server.hub.create_document(owner, "Read me", "text").await.unwrap();
    server.gate.grant(doc.id, viewer, PermissionLevel::View, owner);

    let (client, mut events, mut replica) = join(&server.url, viewer, doc.id).await;
    replica.local_edit(Edit::insert(0, "vandal ")).unwrap();
    assert!(client.flush(&mut replica).await.unwrap());

    loop {
        if let ServerMessage::Error { kind, client_seq, .. } = next_message(&mut events).await {
            assert_eq!(kind, ErrorKind::Unauthorized);
            assert_eq!(client_seq, Some(1));
            break;
        }
    }

    let snapshot = server.hub.snapshot(owner, doc.id).await.unwrap();
    assert_eq!(snapshot.content, "text");
    assert_eq!(snapshot.version, 0);
}

#[tokio::test]
async fn test_ack_carries_assigned_version() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let doc = server.hub.create_document(owner, "t", "").await.unwrap();
    let (client, mut events, _) = join(&server.url, owner, doc.id).await;

    client
        .send(ClientMessage::SubmitOperation {
            document: doc.id,
            base_version: 0,
            client_seq: 41,
            edits: vec![Edit::insert(0, "first")],
        })
        .await
        .unwrap();

    loop {
        if let ServerMessage::Ack { client_seq, assigned_version, .. } = next_message(&mut events).await {
            assert_eq!(client_seq, 41);
            assert_eq!(assigned_version, 1);
            break;
        }
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let server = start_test_server().await;
    let (client, mut events, _) = {
        let owner = Uuid::new_v4();
        let doc = server.hub.create_document(owner, "t", "").await.unwrap();
        join(&server.url, owner, doc.id).await
    };

    client.ping().await.unwrap();
    loop {
        if next_message(&mut events).await == ServerMessage::Pong {
            break;
        }
    }
}

#[tokio::test]
async fn test_disconnect_ends_sessions() {
    let server = start_test_server().await;
    let owner = Uuid::new_v4();
    let guest = Uuid::new_v4();
    let doc = server.hub.create_document(owner, "t", "").await.unwrap();
    server.gate.grant(doc.id, guest, PermissionLevel::View, owner);

    let (_client_a, mut events_a, _) = join(&server.url, owner, doc.id).await;
    let (mut client_b, _events_b, replica_b) = join(&server.url, guest, doc.id).await;
    let guest_session = replica_b.session().cloned().unwrap();
    assert_eq!(server.hub.active_sessions(owner, doc.id).await.unwrap().len(), 2);

    client_b.disconnect().await;

    loop {
        if let ServerMessage::PresenceLeave { session, .. } = next_message(&mut events_a).await {
            assert_eq!(session, guest_session);
            break;
        }
    }
    assert_eq!(server.hub.active_sessions(owner, doc.id).await.unwrap().len(), 1);
}
