//! # scribe-collab, real-time synchronization core for scribe
//!
//! Turns concurrent edits from many editors into one totally ordered,
//! durable version history per document, and keeps every subscriber's
//! replica converged with the authoritative text.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (transport) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌─────────────┐      ┌─────────────────┐
//! │ClientDocument│                    │ DocumentHub │ ───► │ SessionRegistry │
//! │ (local OT)   │                    └──────┬──────┘      └─────────────────┘
//! └──────────────┘                           │ one per open document
//!                                     ┌──────┴────────┐
//!                                     │ DocumentActor │──► VersionStore
//!                                     └──┬─────────┬──┘
//!                               PresenceTracker  BroadcastGroup
//! ```
//!
//! ## Modules
//!
//! - [`actor`]: Sequential admission pipeline, one per open document
//! - [`hub`]: Actor arena and the connection-facing API
//! - [`registry`]: Connection → user and per-document session table
//! - [`presence`]: Cursors, selections and idle sweeps
//! - [`broadcast`]: Gap-checked fan-out of admitted operations
//! - [`storage`]: Version store (in-memory and RocksDB)
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`server`]: WebSocket transport adapter
//! - [`client`]: WebSocket client and client-side OT replica

pub mod actor;
pub mod broadcast;
pub mod client;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use actor::{Ack, ActorHandle, Caller, DocumentAction, DocumentActor, Subscribed, SyncPoint};
pub use broadcast::{
    BroadcastGroup, BroadcastStats, OperationBroadcast, PresenceEvent, Subscription,
    SubscriptionError, SubscriptionEvent,
};
pub use client::{ClientDocument, ConnectionState, RemoteOutcome, SyncClient, SyncEvent};
pub use hub::{DocumentHub, HubConfig};
pub use presence::{CursorColor, PeerPresence, PresenceTracker, Selection, Session, SessionId};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use registry::{ConnectionId, SessionRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    MemoryVersionStore, RocksVersionStore, Snapshot, StoreConfig, StoreError, VersionStore,
};
