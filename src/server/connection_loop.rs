// src/server/connection_loop.rs

//! The accept loop: takes one TCP connection at a time, spawns a session
//! task for it, and on a shutdown signal cancels every live session and
//! background task before deregistering this replica and exiting.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(windows)]
use tokio::signal;

use super::context::ServerContext;
use crate::connection::handle_connection;

/// Waits for SIGINT/SIGTERM on Unix, or Ctrl-C on Windows.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }
    #[cfg(windows)]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl-C, starting graceful shutdown");
    }
}

/// Runs the accept loop until a shutdown signal or background-task failure,
/// then drives graceful shutdown to completion.
pub async fn run(mut ctx: ServerContext) {
    let mut session_id: u64 = 0;
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => {
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("background task failed: {e}, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!("background task panicked: {e:?}, shutting down");
                        break;
                    }
                }
            }

            accepted = ctx.listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        session_id = session_id.wrapping_add(1);
                        let state = ctx.state.clone();
                        let shutdown_rx = ctx.shutdown_tx.subscribe();
                        info!(session = session_id, %addr, "accepted connection");
                        sessions.spawn(handle_connection(socket, addr, state, session_id, shutdown_rx));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                }
            }

            Some(res) = sessions.join_next() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!("session task panicked: {e:?}");
                    }
                }
            }
        }
    }

    info!("broadcasting shutdown to all sessions and background tasks");
    let _ = ctx.shutdown_tx.send(());

    let shutdown_grace = ctx.state.config.proxy.shutdown_grace;
    if tokio::time::timeout(shutdown_grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!(
            grace_ms = shutdown_grace.as_millis() as u64,
            "sessions did not drain within the shutdown grace period, forcing exit"
        );
        sessions.shutdown().await;
    }

    ctx.state.coordinator.deregister_self().await;

    if tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for background tasks to finish cleanly");
    }

    info!("shutdown complete");
}
