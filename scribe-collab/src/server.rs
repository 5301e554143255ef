//! WebSocket transport for the document hub.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── forwarder (doc 1) ──┐
//!            ├── handle_connection ────┤                       ├── outbound queue ──► Client A
//! Client B ──┘        │                └── forwarder (doc 2) ──┘
//!                     ▼
//!                DocumentHub ── DocumentActor (per doc) ── VersionStore
//! ```
//!
//! Each connection runs one task. Requests are answered directly on the
//! socket; every subscription gets a forwarder task that turns broadcast
//! events into frames. A forwarder that falls behind resynchronizes and
//! sends a fresh `Synced` before continuing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_core::{PermissionGate, SyncError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{PresenceEvent, Subscription, SubscriptionError, SubscriptionEvent};
use crate::hub::{DocumentHub, HubConfig};
use crate::presence::{Selection, SessionId};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::ConnectionId;
use crate::storage::{MemoryVersionStore, RocksVersionStore, StoreConfig, StoreError, VersionStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Document actor tuning
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            hub: HubConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_operations: u64,
    pub resyncs: u64,
}

type Stats = Arc<RwLock<ServerStats>>;
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-connection state owned by the connection task.
struct ConnectionState {
    addr: SocketAddr,
    connection: Option<ConnectionId>,
    forwarders: HashMap<Uuid, JoinHandle<()>>,
    outbound: mpsc::Sender<ServerMessage>,
}

impl ConnectionState {
    fn stop_forwarder(&mut self, document: Uuid) {
        if let Some(task) = self.forwarders.remove(&document) {
            task.abort();
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<DocumentHub>,
    stats: Stats,
}

impl SyncServer {
    /// Create a server, opening RocksDB at `storage_path` if configured.
    pub fn new(config: ServerConfig, gate: Arc<dyn PermissionGate>) -> Result<Self, StoreError> {
        let store: Arc<dyn VersionStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksVersionStore::open(StoreConfig::new(path.clone()))?),
            None => {
                log::warn!("No storage path configured, documents are kept in memory only");
                Arc::new(MemoryVersionStore::new())
            }
        };
        let hub = Arc::new(DocumentHub::new(store, gate, config.hub.clone()));
        Ok(Self::with_hub(config, hub))
    }

    /// Serve an existing hub.
    pub fn with_hub(config: ServerConfig, hub: Arc<DocumentHub>) -> Self {
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn hub(&self) -> &Arc<DocumentHub> {
        &self.hub
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let queue = self.config.hub.broadcast_capacity;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, queue).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<DocumentHub>,
        stats: Stats,
        queue: usize,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (outbound, outbound_rx) = mpsc::channel(queue.max(1));
        let mut state = ConnectionState {
            addr,
            connection: None,
            forwarders: HashMap::new(),
            outbound,
        };

        let result = Self::pump(ws_stream, outbound_rx, &mut state, &hub, &stats).await;

        // Cleanup: stop forwarders, end every session of this connection
        for (_, task) in state.forwarders.drain() {
            task.abort();
        }
        if let Some(connection) = state.connection.take() {
            let left = hub.disconnect(&connection).await;
            log::info!("Connection {connection} from {addr} closed ({left} subscriptions)");
        }
        stats.write().await.active_connections -= 1;

        result
    }

    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut outbound_rx: mpsc::Receiver<ServerMessage>,
        state: &mut ConnectionState,
        hub: &Arc<DocumentHub>,
        stats: &Stats,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match ClientMessage::decode(&data) {
                                Ok(request) => {
                                    for reply in Self::handle_message(request, state, hub, stats).await {
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {}: {e}", state.addr);
                                    let err = SyncError::invalid(e.to_string());
                                    let reply = ServerMessage::error(None, None, &err);
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", state.addr);
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", state.addr);
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast message
                Some(msg) = outbound_rx.recv() => {
                    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                }
            }
        }
    }

    /// Turn one request into hub calls. Returns the direct replies.
    async fn handle_message(
        request: ClientMessage,
        state: &mut ConnectionState,
        hub: &Arc<DocumentHub>,
        stats: &Stats,
    ) -> Vec<ServerMessage> {
        let document = request.document();

        let greeted = state.connection.clone();
        let connection = match (&request, greeted) {
            (ClientMessage::Hello { user }, None) => {
                let connection = hub.connect(*user);
                log::info!("{} greeted as {user} (connection {connection})", state.addr);
                state.connection = Some(connection.clone());
                return vec![ServerMessage::Welcome { connection }];
            }
            (ClientMessage::Hello { .. }, Some(_)) => {
                let err = SyncError::invalid("connection already greeted");
                return vec![ServerMessage::error(None, None, &err)];
            }
            (_, None) => {
                return vec![ServerMessage::error(document, None, &SyncError::Unauthorized)];
            }
            (_, Some(connection)) => connection,
        };

        match request {
            ClientMessage::Hello { .. } => Vec::new(),

            ClientMessage::Subscribe { document } => match hub.subscribe(&connection, document).await {
                Ok(subscribed) => {
                    state.stop_forwarder(document);
                    let task = tokio::spawn(Self::forward(
                        hub.clone(),
                        stats.clone(),
                        connection,
                        subscribed.session.clone(),
                        subscribed.subscription,
                        state.outbound.clone(),
                    ));
                    state.forwarders.insert(document, task);
                    vec![ServerMessage::synced(subscribed.session, subscribed.sync)]
                }
                Err(e) => {
                    log::warn!("Subscribe to {document} from {} failed: {e}", state.addr);
                    vec![ServerMessage::error(Some(document), None, &e)]
                }
            },

            ClientMessage::SubmitOperation {
                document,
                base_version,
                client_seq,
                edits,
            } => match hub
                .submit(&connection, document, base_version, client_seq, edits)
                .await
            {
                Ok(ack) => vec![ServerMessage::ack(&ack)],
                Err(e) => {
                    stats.write().await.rejected_operations += 1;
                    vec![ServerMessage::error(Some(document), Some(client_seq), &e)]
                }
            },

            ClientMessage::PresenceUpdate {
                document,
                cursor,
                selection_start,
                selection_end,
            } => {
                let selection = Selection::new(selection_start, selection_end);
                match hub.update_presence(&connection, document, cursor, selection).await {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![ServerMessage::error(Some(document), None, &e)],
                }
            }

            ClientMessage::Unsubscribe { document } => {
                state.stop_forwarder(document);
                match hub.unsubscribe(&connection, document).await {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![ServerMessage::error(Some(document), None, &e)],
                }
            }

            ClientMessage::Ping => {
                // Heartbeat keeps every session of this connection alive.
                let documents: Vec<Uuid> = state.forwarders.keys().copied().collect();
                for document in documents {
                    if let Err(e) = hub.touch(&connection, document).await {
                        log::debug!("Heartbeat on {document} failed: {e}");
                    }
                }
                vec![ServerMessage::Pong]
            }
        }
    }

    /// Relay one subscription into the connection's outbound queue.
    async fn forward(
        hub: Arc<DocumentHub>,
        stats: Stats,
        connection: ConnectionId,
        session: SessionId,
        mut subscription: Subscription,
        outbound: mpsc::Sender<ServerMessage>,
    ) {
        let document = subscription.document();

        loop {
            let msg = match subscription.next().await {
                Ok(SubscriptionEvent::Operation(op)) => ServerMessage::operation(&op),
                Ok(SubscriptionEvent::Presence(event)) => {
                    if Self::is_own_presence(&event, &session) {
                        continue;
                    }
                    ServerMessage::presence(document, &event)
                }
                Err(err) => {
                    match &err {
                        SubscriptionError::Lagged { last_version } => {
                            log::warn!("Session {session} lagged on {document} after version {last_version}, resyncing");
                        }
                        SubscriptionError::Closed => {
                            log::debug!("Broadcast for {document} closed, resyncing session {session}");
                        }
                    }
                    match hub.resync(&connection, document).await {
                        Ok((sync, fresh)) => {
                            subscription = fresh;
                            stats.write().await.resyncs += 1;
                            ServerMessage::synced(session.clone(), sync)
                        }
                        Err(e) => {
                            log::warn!("Resync of {session} on {document} failed: {e}");
                            let _ = outbound.send(ServerMessage::error(Some(document), None, &e)).await;
                            return;
                        }
                    }
                }
            };

            if outbound.send(msg).await.is_err() {
                return;
            }
        }
    }

    fn is_own_presence(event: &PresenceEvent, session: &SessionId) -> bool {
        match event {
            PresenceEvent::Joined(peer) | PresenceEvent::Updated(peer) => &peer.session == session,
            PresenceEvent::Left { session: left, .. } => left == session,
        }
    }
}
