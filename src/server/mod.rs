// src/server/mod.rs

//! Orchestrates startup: build every long-lived component, spawn the
//! background tasks, then hand off to the accept loop until shutdown.

mod connection_loop;
pub mod context;
mod initialization;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, reload};

use crate::config::Config;

pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let ctx = initialization::setup(config, log_reload_handle).await?;
    connection_loop::run(ctx).await;
    Ok(())
}
