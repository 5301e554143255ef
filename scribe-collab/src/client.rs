//! WebSocket sync client and the client-side OT state machine.
//!
//! Provides:
//! - [`ClientDocument`]: local replica of one document with at most one
//!   operation in flight and a buffer of edits made meanwhile
//! - [`SyncClient`]: connection lifecycle, request sending, event stream
//!
//! ```text
//!  local edit ──► buffer ──take_outgoing──► inflight ──► server
//!                                              ▲
//!  own broadcast (same session, client_seq) ───┘ confirms
//!  remote broadcast ──► transform past inflight, then buffer ──► text
//! ```

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_core::{apply, transform_edits, Edit, SyncError};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::{Selection, SessionId};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Outcome of feeding a broadcast operation to a [`ClientDocument`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Already reflected locally.
    Ignored,
    /// Our in-flight operation was admitted.
    Confirmed { version: u64 },
    /// A peer's operation, as applied to the local text.
    Applied { version: u64, edits: Vec<Edit> },
    /// A version was skipped; the replica must resync.
    Gap { expected: u64, got: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Inflight {
    client_seq: u64,
    edits: Vec<Edit>,
}

/// Local replica of one document.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    document: Uuid,
    user: Uuid,
    session: Option<SessionId>,
    text: String,
    /// Last server version reflected in `text`.
    version: u64,
    inflight: Option<Inflight>,
    buffer: Vec<Edit>,
    next_seq: u64,
    needs_resync: bool,
}

impl ClientDocument {
    /// Unsynchronized replica; call [`sync`](Self::sync) on `Synced`.
    pub fn new(document: Uuid, user: Uuid) -> Self {
        Self {
            document,
            user,
            session: None,
            text: String::new(),
            version: 0,
            inflight: None,
            buffer: Vec::new(),
            next_seq: 1,
            needs_resync: true,
        }
    }

    pub fn document(&self) -> Uuid {
        self.document
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Whether local edits are waiting for confirmation.
    pub fn has_pending(&self) -> bool {
        self.inflight.is_some() || !self.buffer.is_empty()
    }

    /// Adopt a synchronization point.
    ///
    /// Unconfirmed local edits cannot be placed relative to the new state
    /// and are discarded; they are returned so the caller can re-apply them
    /// as new edits if it wants to.
    pub fn sync(&mut self, session: SessionId, content: impl Into<String>, version: u64) -> Vec<Edit> {
        let mut dropped = self.inflight.take().map(|i| i.edits).unwrap_or_default();
        dropped.append(&mut self.buffer);

        self.session = Some(session);
        self.text = content.into();
        self.version = version;
        self.needs_resync = false;

        if !dropped.is_empty() {
            log::warn!("Discarded {} unconfirmed edits on {} after resync", dropped.len(), self.document);
        }
        dropped
    }

    /// Apply an edit locally and queue it for sending.
    pub fn local_edit(&mut self, edit: Edit) -> Result<(), SyncError> {
        if edit.is_noop() {
            return Err(SyncError::invalid("empty edit"));
        }
        let applied = apply(&self.text, std::slice::from_ref(&edit));
        self.text = applied.text;
        self.buffer.extend(applied.edits);
        Ok(())
    }

    /// The next operation to submit, if nothing is in flight.
    pub fn take_outgoing(&mut self) -> Option<ClientMessage> {
        if self.inflight.is_some() || self.buffer.is_empty() || self.needs_resync {
            return None;
        }
        let client_seq = self.next_seq;
        self.next_seq += 1;
        let edits = std::mem::take(&mut self.buffer);
        self.inflight = Some(Inflight {
            client_seq,
            edits: edits.clone(),
        });
        Some(ClientMessage::SubmitOperation {
            document: self.document,
            base_version: self.version,
            client_seq,
            edits,
        })
    }

    /// Feed a `BroadcastOperation`.
    pub fn receive(
        &mut self,
        version: u64,
        author: Uuid,
        session: &SessionId,
        client_seq: u64,
        edits: &[Edit],
    ) -> RemoteOutcome {
        if version <= self.version {
            return RemoteOutcome::Ignored;
        }
        if self.needs_resync || version != self.version + 1 {
            self.needs_resync = true;
            return RemoteOutcome::Gap {
                expected: self.version + 1,
                got: version,
            };
        }

        let own = self.session.as_ref() == Some(session)
            && self.inflight.as_ref().is_some_and(|i| i.client_seq == client_seq);
        if own {
            self.inflight = None;
            self.version = version;
            return RemoteOutcome::Confirmed { version };
        }

        let mut remote = edits.to_vec();
        if let Some(inflight) = self.inflight.as_mut() {
            let (mine, theirs) = transform_edits(&inflight.edits, self.user, &remote, author);
            inflight.edits = mine;
            remote = theirs;
        }
        if !self.buffer.is_empty() {
            let (mine, theirs) = transform_edits(&self.buffer, self.user, &remote, author);
            self.buffer = mine;
            remote = theirs;
        }

        let applied = apply(&self.text, &remote);
        self.text = applied.text;
        self.version = version;
        RemoteOutcome::Applied {
            version,
            edits: applied.edits,
        }
    }

    /// The server rejected `client_seq`. Local text now diverges from the
    /// server, so the replica must resync.
    pub fn reject(&mut self, client_seq: u64) -> bool {
        match &self.inflight {
            Some(i) if i.client_seq == client_seq => {
                self.inflight = None;
                self.needs_resync = true;
                true
            }
            _ => false,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A decoded server message
    Message(ServerMessage),
}

/// The sync client.
///
/// Manages a WebSocket connection to the sync server. Messages received
/// are surfaced as [`SyncEvent`]s; documents are driven by the caller,
/// typically through a [`ClientDocument`] per subscription.
pub struct SyncClient {
    /// Identity announced in `Hello`
    user: Uuid,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    pub fn new(user: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    pub fn user(&self) -> Uuid {
        self.user
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and greet the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Announced before the reader starts, so it precedes every message.
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Writer task: encode and forward; a closed channel closes the socket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let frame = match msg.encode() {
                    Ok(bytes) => Message::Binary(bytes.into()),
                    Err(e) => {
                        log::error!("Failed to encode {msg:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: decode server messages into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(msg) => {
                            if event_tx.send(SyncEvent::Message(msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        out_tx
            .send(ClientMessage::Hello { user: self.user })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);
        Ok(())
    }

    /// Queue a message for the server.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn subscribe(&self, document: Uuid) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Subscribe { document }).await
    }

    pub async fn unsubscribe(&self, document: Uuid) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Unsubscribe { document }).await
    }

    /// Send the next pending operation of `doc`, if any.
    pub async fn flush(&self, doc: &mut ClientDocument) -> Result<bool, ProtocolError> {
        match doc.take_outgoing() {
            Some(msg) => self.send(msg).await.map(|_| true),
            None => Ok(false),
        }
    }

    pub async fn update_presence(&self, document: Uuid, cursor: usize, selection: Selection) -> Result<(), ProtocolError> {
        self.send(ClientMessage::presence(document, cursor, selection)).await
    }

    /// Heartbeat.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn is_connected(&self) -> bool {
        self.outgoing_tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced(content: &str) -> (ClientDocument, SessionId) {
        let mut doc = ClientDocument::new(Uuid::nil(), Uuid::new_v4());
        let session = SessionId::new();
        doc.sync(session.clone(), content, 0);
        (doc, session)
    }

    fn submitted(doc: &mut ClientDocument) -> (u64, Vec<Edit>) {
        match doc.take_outgoing() {
            Some(ClientMessage::SubmitOperation { client_seq, edits, .. }) => (client_seq, edits),
            other => panic!("expected a submission, got {other:?}"),
        }
    }

    #[test]
    fn test_new_document_needs_sync() {
        let mut doc = ClientDocument::new(Uuid::nil(), Uuid::new_v4());
        assert!(doc.needs_resync());
        doc.local_edit(Edit::insert(0, "x")).unwrap();
        assert!(doc.take_outgoing().is_none());
    }

    #[test]
    fn test_two_replicas_converge() {
        let (mut a, a_session) = synced("hello");
        let (mut b, b_session) = synced("hello");

        a.local_edit(Edit::insert(0, "X")).unwrap();
        b.local_edit(Edit::insert(5, "Y")).unwrap();
        let (a_seq, a_edits) = submitted(&mut a);
        let (b_seq, _) = submitted(&mut b);

        // Server admits A as v1, then B rebased as v2.
        let v2_edits = vec![Edit::insert(6, "Y")];
        assert_eq!(a.receive(1, a.user, &a_session, a_seq, &a_edits), RemoteOutcome::Confirmed { version: 1 });
        assert!(matches!(a.receive(2, b.user, &b_session, b_seq, &v2_edits), RemoteOutcome::Applied { .. }));

        assert!(matches!(b.receive(1, a.user, &a_session, a_seq, &a_edits), RemoteOutcome::Applied { .. }));
        assert_eq!(b.receive(2, b.user, &b_session, b_seq, &v2_edits), RemoteOutcome::Confirmed { version: 2 });

        assert_eq!(a.text(), "XhelloY");
        assert_eq!(b.text(), "XhelloY");
        assert!(!a.has_pending() && !b.has_pending());
    }

    #[test]
    fn test_buffered_edits_wait_for_confirmation() {
        let (mut doc, session) = synced("");
        doc.local_edit(Edit::insert(0, "ab")).unwrap();
        let (seq, edits) = submitted(&mut doc);

        doc.local_edit(Edit::insert(2, "cd")).unwrap();
        assert!(doc.take_outgoing().is_none());

        doc.receive(1, doc.user, &session, seq, &edits);
        match doc.take_outgoing() {
            Some(ClientMessage::SubmitOperation { base_version, edits, .. }) => {
                assert_eq!(base_version, 1);
                assert_eq!(edits, vec![Edit::insert(2, "cd")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_remote_edit_shifts_buffer() {
        let (mut doc, _) = synced("abc");
        doc.local_edit(Edit::insert(3, "!")).unwrap();

        let peer = SessionId::new();
        let outcome = doc.receive(1, Uuid::new_v4(), &peer, 1, &[Edit::delete(0, 1)]);
        assert!(matches!(outcome, RemoteOutcome::Applied { version: 1, .. }));
        assert_eq!(doc.text(), "bc!");

        let (_, edits) = submitted(&mut doc);
        assert_eq!(edits, vec![Edit::insert(2, "!")]);
    }

    #[test]
    fn test_gap_and_duplicates() {
        let (mut doc, _) = synced("x");
        let peer = SessionId::new();
        let author = Uuid::new_v4();

        assert!(matches!(doc.receive(1, author, &peer, 1, &[Edit::insert(0, "a")]), RemoteOutcome::Applied { .. }));
        assert_eq!(doc.receive(1, author, &peer, 1, &[Edit::insert(0, "a")]), RemoteOutcome::Ignored);
        assert_eq!(
            doc.receive(3, author, &peer, 3, &[Edit::insert(0, "c")]),
            RemoteOutcome::Gap { expected: 2, got: 3 }
        );
        assert!(doc.needs_resync());
        assert_eq!(doc.text(), "ax");
    }

    #[test]
    fn test_rejection_forces_resync() {
        let (mut doc, _) = synced("");
        doc.local_edit(Edit::insert(0, "nope")).unwrap();
        let (seq, _) = submitted(&mut doc);

        assert!(!doc.reject(seq + 1));
        assert!(doc.reject(seq));
        assert!(doc.needs_resync());

        let dropped = doc.sync(SessionId::new(), "server", 4);
        assert!(dropped.is_empty());
        assert_eq!((doc.text(), doc.version()), ("server", 4));
    }

    #[test]
    fn test_sync_returns_unconfirmed_edits() {
        let (mut doc, _) = synced("");
        doc.local_edit(Edit::insert(0, "a")).unwrap();
        submitted(&mut doc);
        doc.local_edit(Edit::insert(1, "b")).unwrap();

        let dropped = doc.sync(SessionId::new(), "fresh", 9);
        assert_eq!(dropped, vec![Edit::insert(0, "a"), Edit::insert(1, "b")]);
        assert!(!doc.has_pending());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = SyncClient::new(Uuid::new_v4(), "ws://127.0.0.1:1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
        assert_eq!(client.ping().await, Err(ProtocolError::ConnectionClosed));
    }
}
