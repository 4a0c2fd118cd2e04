// src/admission.rs

//! The bounded wait queue and per-bucket circuit breaker that sit in front of
//! the semaphore. Bounding is per-replica, not fleet-wide: its job is to cap
//! this replica's own memory and task count, while fleet-wide fairness is
//! left to the L4 load balancer in front of the replica set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::core::errors::ProxyResult;
use crate::semaphore::{self, WaitOutcome};

/// Typed rejection reasons so callers can choose the right wire-level error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("bucket is not configured")]
    Unconfigured,
    #[error("admission queue is full")]
    QueueFull,
    #[error("admission queue wait timed out")]
    QueueTimeout,
    #[error("admission canceled")]
    Canceled,
}

/// Wraps the coordinator with a per-replica, per-bucket bounded wait queue.
pub struct AdmissionQueue {
    config: Arc<Config>,
    coordinator: Arc<Coordinator>,
    depth: Mutex<HashMap<String, usize>>,
}

impl AdmissionQueue {
    pub fn new(config: Arc<Config>, coordinator: Arc<Coordinator>) -> Arc<Self> {
        Arc::new(Self {
            config,
            coordinator,
            depth: Mutex::new(HashMap::new()),
        })
    }

    /// Tries a fast acquire; if the bucket is full, either circuit-breaks
    /// immediately (queue already at `max_queue_size`) or enters the wait
    /// queue up to the bucket's configured timeout.
    pub async fn acquire(
        &self,
        bucket_id: &str,
        cancel_rx: broadcast::Receiver<()>,
    ) -> Result<i64, AdmissionError> {
        let fast = semaphore::try_acquire(&self.coordinator, bucket_id)
            .await
            .map_err(|_| AdmissionError::Unconfigured)?;

        match fast {
            WaitOutcome::Granted(n) => return Ok(n),
            WaitOutcome::Unconfigured => return Err(AdmissionError::Unconfigured),
            WaitOutcome::Full => {}
            WaitOutcome::Timeout | WaitOutcome::Canceled => unreachable!("try_acquire never waits"),
        }

        let max_queue_size = self.config.proxy.max_queue_size;
        if max_queue_size > 0 {
            let mut depth = self.depth.lock();
            let current = depth.entry(bucket_id.to_string()).or_insert(0);
            if *current >= max_queue_size {
                return Err(AdmissionError::QueueFull);
            }
            *current += 1;
        }

        let result = self.wait_and_track(bucket_id, cancel_rx).await;

        if max_queue_size > 0 {
            let mut depth = self.depth.lock();
            if let Some(current) = depth.get_mut(bucket_id) {
                *current = current.saturating_sub(1);
            }
        }

        result
    }

    async fn wait_and_track(
        &self,
        bucket_id: &str,
        cancel_rx: broadcast::Receiver<()>,
    ) -> Result<i64, AdmissionError> {
        let timeout = self.queue_timeout(bucket_id);
        let started = std::time::Instant::now();
        let outcome = semaphore::wait(&self.coordinator, bucket_id, timeout, cancel_rx)
            .await
            .map_err(|_| AdmissionError::Unconfigured)?;

        match outcome {
            WaitOutcome::Granted(n) => Ok(n),
            WaitOutcome::Unconfigured => Err(AdmissionError::Unconfigured),
            WaitOutcome::Timeout => {
                tracing::debug!(
                    bucket = bucket_id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "admission queue wait timed out"
                );
                Err(AdmissionError::QueueTimeout)
            }
            WaitOutcome::Canceled => Err(AdmissionError::Canceled),
            WaitOutcome::Full => unreachable!("semaphore::wait never returns Full"),
        }
    }

    fn queue_timeout(&self, bucket_id: &str) -> Duration {
        self.config
            .bucket(bucket_id)
            .map(|b| b.effective_queue_timeout(&self.config.proxy))
            .unwrap_or(self.config.proxy.queue_timeout)
    }

    /// Current wait-queue depth for one bucket on this replica.
    pub fn depth(&self, bucket_id: &str) -> usize {
        *self.depth.lock().get(bucket_id).unwrap_or(&0)
    }

    pub async fn release(&self, bucket_id: &str) {
        self.coordinator.release(bucket_id).await;
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

/// Re-exported so callers that only need the probe don't have to reach into
/// the coordinator module directly.
pub async fn probe_fallback(coordinator: &Coordinator) -> ProxyResult<bool> {
    Ok(coordinator.is_fallback())
}
