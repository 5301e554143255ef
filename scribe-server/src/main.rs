//! Scribe sync server: serves collaborative markdown documents over
//! WebSocket.
//!
//! Every flag can also be set through its `SCRIBE_*` environment variable.
//! Without `--storage` all documents live in memory and are lost on exit.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use scribe_collab::hub::HubConfig;
use scribe_collab::server::{BoxError, ServerConfig, SyncServer};
use scribe_core::PermissionTable;

#[derive(Parser, Debug)]
#[command(name = "scribe-server")]
#[command(about = "Real-time synchronization server for collaborative markdown")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SCRIBE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for document history
    #[arg(long, env = "SCRIBE_STORAGE", value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Seconds without activity before a session is dropped from presence
    #[arg(long, env = "SCRIBE_IDLE_TIMEOUT", default_value_t = 300)]
    idle_timeout_secs: u64,

    /// Broadcast buffer per document before slow subscribers are resynced
    #[arg(long, env = "SCRIBE_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: self.storage.clone(),
            hub: HubConfig {
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                broadcast_capacity: self.broadcast_capacity.max(1),
                ..HubConfig::default()
            },
        }
    }
}

/// Open the store and report what it holds.
async fn open(config: ServerConfig) -> Result<SyncServer, BoxError> {
    match &config.storage_path {
        Some(path) => info!("Document history at {}", path.display()),
        None => info!("No storage path given, running in memory"),
    }

    let server = SyncServer::new(config, Arc::new(PermissionTable::new()))?;
    let documents = server.hub().store().list_documents().await?;
    info!("{} documents available", documents.len());
    Ok(server)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting scribe-server {}", env!("CARGO_PKG_VERSION"));

    let server = open(args.server_config()).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, {} open documents", server.hub().open_documents().await);
        }
    }

    Ok(())
}
