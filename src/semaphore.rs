// src/semaphore.rs

//! Blocking wait on top of the coordinator's single-shot acquire. Ordering
//! is deliberately unspecified: a release notification does not hand a slot
//! to a particular waiter, it just wakes everyone up to race a retry. This
//! keeps the implementation simple; starvation is bounded in practice by the
//! polling floor below.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::coordinator::{AcquireOutcome, Coordinator};
use crate::core::errors::ProxyResult;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a bounded wait for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Granted(i64),
    Full,
    Unconfigured,
    Timeout,
    Canceled,
}

/// Attempts a single, non-blocking acquire.
pub async fn try_acquire(coordinator: &Coordinator, bucket_id: &str) -> ProxyResult<WaitOutcome> {
    Ok(match coordinator.acquire(bucket_id).await? {
        AcquireOutcome::Granted(n) => WaitOutcome::Granted(n),
        AcquireOutcome::Full => WaitOutcome::Full,
        AcquireOutcome::Unconfigured => WaitOutcome::Unconfigured,
    })
}

/// Blocks until a slot is acquired, the timeout elapses, or `cancel_rx` fires.
/// Driven by release notifications plus a fixed polling interval that acts as
/// a safety net for notifications dropped by the lossy broadcast channel.
pub async fn wait(
    coordinator: &Coordinator,
    bucket_id: &str,
    timeout: Duration,
    mut cancel_rx: broadcast::Receiver<()>,
) -> ProxyResult<WaitOutcome> {
    match try_acquire(coordinator, bucket_id).await? {
        WaitOutcome::Full => {}
        other => return Ok(other),
    }

    let mut release_rx = coordinator.release_receiver(bucket_id);
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.tick().await; // consume the immediate first tick
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = cancel_rx.recv() => {
                return Ok(WaitOutcome::Canceled);
            }
            _ = &mut deadline => {
                return Ok(WaitOutcome::Timeout);
            }
            notification = release_rx.recv() => {
                if notification.is_err() {
                    trace!(bucket = bucket_id, "release channel closed or lagged, relying on poll floor");
                }
                match try_acquire(coordinator, bucket_id).await? {
                    WaitOutcome::Full => continue,
                    other => return Ok(other),
                }
            }
            _ = poll.tick() => {
                match try_acquire(coordinator, bucket_id).await? {
                    WaitOutcome::Full => continue,
                    other => return Ok(other),
                }
            }
        }
    }
}
