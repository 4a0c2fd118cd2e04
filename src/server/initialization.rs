// src/server/initialization.rs

//! Assembles every long-lived component the proxy needs before the accept
//! loop starts: the coordinator's store connection, the admission queue, the
//! listening socket, and the background tasks that keep the coordinator's
//! view of the fleet current.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

use super::context::{ServerContext, ServerState};
use crate::admission::AdmissionQueue;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::heartbeat;

/// Initializes all server components before starting the main loop. The
/// `log_reload_handle` is threaded through for parity with the rest of the
/// stack even though nothing currently changes the filter at runtime.
pub async fn setup(
    config: Config,
    _log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    let config = Arc::new(config);
    log_startup_info(&config);

    let (shutdown_tx, _) = broadcast::channel(1);

    let coordinator = Coordinator::connect(config.clone())
        .await
        .context("failed to initialize the distributed admission coordinator")?;
    let admission = AdmissionQueue::new(config.clone(), coordinator.clone());

    let listener = TcpListener::bind((
        config.proxy.listen_host.as_str(),
        config.proxy.listen_port,
    ))
    .await
    .with_context(|| {
        format!(
            "failed to bind {}:{}",
            config.proxy.listen_host, config.proxy.listen_port
        )
    })?;
    info!(
        host = %config.proxy.listen_host,
        port = config.proxy.listen_port,
        "listening for TDS connections"
    );

    let mut background_tasks: JoinSet<Result<(), anyhow::Error>> = JoinSet::new();

    let heartbeat_coordinator = coordinator.clone();
    let heartbeat_shutdown = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        heartbeat::run(heartbeat_coordinator, heartbeat_shutdown).await;
        Ok(())
    });

    for bucket in &config.buckets {
        let pump_coordinator = coordinator.clone();
        let bucket_id = bucket.id.clone();
        let pump_shutdown = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            pump_coordinator
                .run_subscription_pump(bucket_id, pump_shutdown)
                .await;
            Ok(())
        });
    }

    let state = Arc::new(ServerState {
        config,
        coordinator,
        admission,
    });

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        background_tasks,
    })
}

fn log_startup_info(config: &Config) {
    info!(
        replica = config.instance_id(),
        buckets = config.buckets.len(),
        fallback_enabled = config.proxy.fallback.enabled,
        "proxy configuration loaded"
    );
    for bucket in &config.buckets {
        info!(
            bucket = %bucket.id,
            address = %bucket.address(),
            max = bucket.max,
            "bucket configured"
        );
    }
}
