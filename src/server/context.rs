// src/server/context.rs

use crate::admission::AdmissionQueue;
use crate::config::Config;
use crate::coordinator::Coordinator;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Shared, read-mostly state handed to every session task. Sessions reference
/// this by cheap `Arc` clone; nothing here ever references a session back.
pub struct ServerState {
    pub config: Arc<Config>,
    pub coordinator: Arc<Coordinator>,
    pub admission: Arc<AdmissionQueue>,
}

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub state: Arc<ServerState>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
