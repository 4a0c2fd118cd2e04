// src/heartbeat.rs

//! Liveness advertisement and dead-replica reaping. One task per replica,
//! ticking at `proxy.heartbeat_interval`; every third tick it also reaps
//! replicas whose heartbeat key has expired.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;

const REAP_EVERY_N_TICKS: u32 = 3;

/// Runs until `shutdown_rx` fires.
pub async fn run(coordinator: Arc<Coordinator>, mut shutdown_rx: broadcast::Receiver<()>) {
    let interval = coordinator.config().proxy.heartbeat_interval;
    let ttl = coordinator.config().proxy.heartbeat_ttl;
    let mut ticker = tokio::time::interval(interval);
    let mut tick_count: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("heartbeat task received shutdown signal");
                return;
            }
            _ = ticker.tick() => {
                tick_count = tick_count.wrapping_add(1);
                run_tick(&coordinator, ttl, tick_count).await;
            }
        }
    }
}

async fn run_tick(coordinator: &Arc<Coordinator>, ttl: Duration, tick_count: u32) {
    if coordinator.is_fallback() && !coordinator.try_exit_fallback().await {
        // Still unreachable; skip this tick's heartbeat write and reaping.
        return;
    }

    if let Err(e) = coordinator.write_heartbeat(ttl).await {
        warn!(error = %e, "failed to write heartbeat");
        return;
    }

    if tick_count % REAP_EVERY_N_TICKS == 0 {
        reap(coordinator).await;
    }
}

async fn reap(coordinator: &Arc<Coordinator>) {
    let self_id = coordinator.config().instance_id();
    let replicas = match coordinator.list_replicas().await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "reaper failed to list replica registry, retrying next tick");
            return;
        }
    };

    for replica_id in replicas {
        if replica_id == self_id {
            continue;
        }
        match coordinator.replica_is_alive(&replica_id).await {
            Ok(true) => continue,
            Ok(false) => {
                if let Err(e) = coordinator.cleanup_dead_replica(&replica_id).await {
                    error!(replica = %replica_id, error = %e, "dead-replica cleanup failed, retrying next tick");
                }
            }
            Err(e) => {
                warn!(replica = %replica_id, error = %e, "failed to check replica liveness, retrying next tick");
            }
        }
    }
}
