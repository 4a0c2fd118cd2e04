// src/coordinator/mod.rs

//! The distributed admission controller. Every other admission component
//! (the semaphore, the queue/circuit-breaker, the session handler) talks to
//! the fleet exclusively through this type.

pub mod fallback;
pub mod scripts;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex as SyncMutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::errors::{ProxyError, ProxyResult};
use fallback::FallbackCounts;
use scripts::{ScriptOutcome, parse_outcome};

/// Outcome of a successful or rejected acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Admitted; carries the new count (global in normal mode, local in fallback).
    Granted(i64),
    /// The bucket is at capacity.
    Full,
    /// The bucket has no configured cap (`max == 0`).
    Unconfigured,
}

/// Capacity, released-slot notification, and crash recovery shared across a
/// fleet of replicas via a Redis-compatible store.
pub struct Coordinator {
    config: Arc<Config>,
    client: redis::Client,
    /// `ConnectionManager` is a cheaply-cloned, multiplexed handle meant for
    /// concurrent use; the lock here only ever guards swapping it out, never
    /// the I/O that follows (see `store_conn`).
    manager: SyncMutex<Option<ConnectionManager>>,
    acquire_script: redis::Script,
    release_script: redis::Script,
    fallback: AtomicBool,
    fallback_counts: FallbackCounts,
    release_senders: SyncMutex<HashMap<String, broadcast::Sender<()>>>,
}

impl Coordinator {
    /// Connects to the store, publishes bucket caps, and registers this
    /// replica. If the store is unreachable at startup, enters fallback mode
    /// when `proxy.fallback.enabled`, otherwise fails startup.
    pub async fn connect(config: Arc<Config>) -> ProxyResult<Arc<Self>> {
        let client = redis::Client::open(config.proxy.store.url.as_str())
            .map_err(|e| ProxyError::Config(format!("invalid store.url: {e}")))?;

        let coordinator = Arc::new(Self {
            config: config.clone(),
            client,
            manager: SyncMutex::new(None),
            acquire_script: redis::Script::new(scripts::ACQUIRE_SCRIPT),
            release_script: redis::Script::new(scripts::RELEASE_SCRIPT),
            fallback: AtomicBool::new(false),
            fallback_counts: FallbackCounts::new(),
            release_senders: SyncMutex::new(HashMap::new()),
        });

        match coordinator.client.get_connection_manager().await {
            Ok(manager) => {
                *coordinator.manager.lock() = Some(manager);
                if let Err(e) = coordinator.register_self().await {
                    if config.proxy.fallback.enabled {
                        warn!("failed to register with store at startup, entering fallback mode: {e}");
                        coordinator.fallback.store(true, Ordering::SeqCst);
                    } else {
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                if config.proxy.fallback.enabled {
                    warn!("shared store unreachable at startup, starting in fallback mode: {e}");
                    coordinator.fallback.store(true, Ordering::SeqCst);
                } else {
                    return Err(ProxyError::StoreTransport(format!(
                        "store unreachable at startup: {e}"
                    )));
                }
            }
        }

        Ok(coordinator)
    }

    /// Clones the current multiplexed store connection for this call.
    /// `ConnectionManager` is designed to be cloned freely for concurrent
    /// use, so the lock guards only the swap, never the I/O that follows.
    fn store_conn(&self) -> ProxyResult<ConnectionManager> {
        self.manager
            .lock()
            .clone()
            .ok_or_else(|| ProxyError::StoreTransport("no store connection".into()))
    }

    /// Publishes each bucket's cap, adds self to the replica registry,
    /// clears this replica's held-slot map, and writes an initial heartbeat.
    ///
    /// The heartbeat write matters as much as the rest: without it, a
    /// replica is visible in `replicas` but has no heartbeat key for up to
    /// one `heartbeat_interval`, and a peer's reaper racing in that window
    /// would see it as dead and `srem` it right back out.
    ///
    /// Shared by `connect` and `try_exit_fallback` — a store restart loses
    /// every key the store held, so recovering from one requires exactly
    /// the same steps as first-time registration.
    async fn register_self(&self) -> ProxyResult<()> {
        let mut conn = self.store_conn()?;
        let replica = self.config.instance_id();

        for bucket in &self.config.buckets {
            let _: () = conn.set(scripts::max_key(&bucket.id), bucket.max).await?;
        }
        let _: () = conn.sadd(scripts::REPLICAS_SET_KEY, replica).await?;
        let _: () = conn.del(scripts::conns_key(replica)).await?;
        let ttl = self.config.proxy.heartbeat_ttl;
        let _: () = conn
            .set_ex(scripts::heartbeat_key(replica), "1", ttl.as_secs().max(1))
            .await?;
        info!(replica, "registered with shared store");
        Ok(())
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.load(Ordering::SeqCst)
    }

    fn enter_fallback(&self, reason: &str) {
        if !self.fallback.swap(true, Ordering::SeqCst) {
            warn!("entering fallback mode: {reason}");
        }
    }

    /// Runs the atomic acquire script, falling back to the local in-memory
    /// admission map on a transport error (or immediately, if already in
    /// fallback mode).
    pub async fn acquire(&self, bucket_id: &str) -> ProxyResult<AcquireOutcome> {
        if self.is_fallback() {
            return Ok(self.acquire_fallback(bucket_id));
        }

        match self.acquire_remote(bucket_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if self.config.proxy.fallback.enabled => {
                self.enter_fallback(&format!("acquire transport error: {e}"));
                Ok(self.acquire_fallback(bucket_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire_remote(&self, bucket_id: &str) -> ProxyResult<AcquireOutcome> {
        let replica = self.config.instance_id();
        let mut conn = self.store_conn()?;

        let raw: String = self
            .acquire_script
            .key(scripts::count_key(bucket_id))
            .key(scripts::max_key(bucket_id))
            .key(scripts::conns_key(replica))
            .arg(bucket_id)
            .invoke_async(&mut conn)
            .await?;

        Ok(match parse_outcome(&raw) {
            ScriptOutcome::Count(n) => AcquireOutcome::Granted(n),
            ScriptOutcome::Full => AcquireOutcome::Full,
            ScriptOutcome::Unconfigured => AcquireOutcome::Unconfigured,
            ScriptOutcome::Underflow => {
                // Not a reachable outcome for the acquire script; treat defensively.
                AcquireOutcome::Unconfigured
            }
        })
    }

    fn acquire_fallback(&self, bucket_id: &str) -> AcquireOutcome {
        let Some(bucket) = self.config.bucket(bucket_id) else {
            return AcquireOutcome::Unconfigured;
        };
        if bucket.max == 0 {
            return AcquireOutcome::Unconfigured;
        }
        let cap = fallback::local_cap(bucket.max, self.config.proxy.fallback.local_limit_divisor);
        match self.fallback_counts.try_acquire(bucket_id, cap) {
            Some(n) => AcquireOutcome::Granted(n as i64),
            None => AcquireOutcome::Full,
        }
    }

    /// Best-effort release: never returns an error to the caller. On a
    /// transport failure the slot is released locally and the fleet-wide
    /// count will be corrected by the reaper once this replica's heartbeat
    /// lapses or fallback mode is entered.
    pub async fn release(&self, bucket_id: &str) {
        if self.is_fallback() {
            self.fallback_counts.release(bucket_id);
            return;
        }

        if let Err(e) = self.release_remote(bucket_id).await {
            warn!(bucket = bucket_id, error = %e, "release against store failed, releasing locally");
            if self.config.proxy.fallback.enabled {
                self.enter_fallback(&format!("release transport error: {e}"));
            }
            self.fallback_counts.release(bucket_id);
        }
    }

    async fn release_remote(&self, bucket_id: &str) -> ProxyResult<()> {
        let replica = self.config.instance_id();
        let mut conn = self.store_conn()?;

        let raw: String = self
            .release_script
            .key(scripts::count_key(bucket_id))
            .key(scripts::conns_key(replica))
            .key(scripts::release_channel(bucket_id))
            .arg(bucket_id)
            .invoke_async(&mut conn)
            .await?;

        if matches!(parse_outcome(&raw), ScriptOutcome::Underflow) {
            debug!(
                bucket = bucket_id,
                "release observed a non-positive counter; reaper already corrected it"
            );
        }
        Ok(())
    }

    /// Returns a receiver for this bucket's release notifications. In
    /// fallback mode the sender is dropped immediately, so the receiver
    /// observes a closed channel right away (the semaphore's polling floor
    /// covers the gap).
    pub fn release_receiver(&self, bucket_id: &str) -> broadcast::Receiver<()> {
        if self.is_fallback() {
            let (_tx, rx) = broadcast::channel(1);
            return rx;
        }
        let mut senders = self.release_senders.lock();
        senders
            .entry(bucket_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    fn release_sender(&self, bucket_id: &str) -> broadcast::Sender<()> {
        self.release_senders
            .lock()
            .entry(bucket_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Runs until `shutdown_rx` fires, forwarding pub/sub release events for
    /// one bucket into the broadcast channel that waiters subscribe to.
    pub async fn run_subscription_pump(
        self: Arc<Self>,
        bucket_id: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            if self.is_fallback() {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => continue,
                }
            }

            let mut pubsub = match self.client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(bucket = %bucket_id, error = %e, "failed to open release subscription, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            if let Err(e) = pubsub.subscribe(scripts::release_channel(&bucket_id)).await {
                warn!(bucket = %bucket_id, error = %e, "failed to subscribe to release channel, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }

            let sender = self.release_sender(&bucket_id);
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    msg = futures::StreamExt::next(&mut stream) => {
                        match msg {
                            Some(_) => {
                                // Lossy by design: a slow waiter loses the
                                // event, and its 500ms poll floor covers it.
                                let _ = sender.send(());
                            }
                            None => break,
                        }
                    }
                }
            }
        }
    }

    // --- Heartbeat & reaper support ---

    pub async fn write_heartbeat(&self, ttl: std::time::Duration) -> ProxyResult<()> {
        let replica = self.config.instance_id();
        let mut conn = self.store_conn()?;
        let _: () = conn
            .set_ex(scripts::heartbeat_key(replica), "1", ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    pub async fn list_replicas(&self) -> ProxyResult<Vec<String>> {
        let mut conn = self.store_conn()?;
        Ok(conn.smembers(scripts::REPLICAS_SET_KEY).await?)
    }

    pub async fn replica_is_alive(&self, replica_id: &str) -> ProxyResult<bool> {
        let mut conn = self.store_conn()?;
        Ok(conn.exists(scripts::heartbeat_key(replica_id)).await?)
    }

    /// Reconciles and removes a dead replica's slot reservations. Idempotent:
    /// concurrent reapers racing on the same dead replica is tolerated
    /// because deleting `replica/<id>/conns` is the last effect and the
    /// negative-count floor corrects any over-subtraction.
    pub async fn cleanup_dead_replica(&self, replica_id: &str) -> ProxyResult<()> {
        let mut conn = self.store_conn()?;

        let held: HashMap<String, i64> = conn.hgetall(scripts::conns_key(replica_id)).await?;

        let mut touched = Vec::new();
        for (bucket_id, n) in &held {
            if *n > 0 {
                let _: i64 = conn.decr(scripts::count_key(bucket_id), *n).await?;
                touched.push(bucket_id.clone());
            }
        }

        let _: () = conn.del(scripts::conns_key(replica_id)).await?;
        let _: () = conn.srem(scripts::REPLICAS_SET_KEY, replica_id).await?;

        for bucket_id in touched {
            let count: i64 = conn.get(scripts::count_key(&bucket_id)).await?;
            if count < 0 {
                let _: () = conn.set(scripts::count_key(&bucket_id), 0).await?;
            }
        }

        info!(replica = replica_id, "reaped dead replica's slot reservations");
        Ok(())
    }

    /// Attempts to leave fallback mode: pings the store, re-runs the full
    /// registration sequence (a store restart loses every key it held, so
    /// bucket caps and the replica registry entry need republishing exactly
    /// as at first connect — see `register_self`), then reconciles the
    /// locally-held counts into `replica/<self>/conns` on top of that.
    /// Leaves fallback mode set if this fails at any step.
    pub async fn try_exit_fallback(&self) -> bool {
        if !self.is_fallback() {
            return true;
        }

        let manager = match self.client.get_connection_manager().await {
            Ok(m) => m,
            Err(e) => {
                debug!("fallback recovery ping failed: {e}");
                return false;
            }
        };
        *self.manager.lock() = Some(manager);

        if let Err(e) = self.register_self().await {
            warn!(error = %e, "failed to re-register with store while exiting fallback, staying in fallback mode");
            return false;
        }

        let replica = self.config.instance_id();
        let snapshot = self.fallback_counts.snapshot();
        let mut conn = match self.store_conn() {
            Ok(c) => c,
            Err(_) => return false,
        };
        for (bucket_id, count) in &snapshot {
            if let Err(e) = conn
                .hset::<_, _, _, ()>(scripts::conns_key(replica), bucket_id, *count)
                .await
            {
                warn!(error = %e, "failed to reconcile fallback counts, staying in fallback mode");
                return false;
            }
        }

        self.fallback_counts.reset();
        self.fallback.store(false, Ordering::SeqCst);
        info!(replica, ?snapshot, "exited fallback mode and reconciled local counts");
        true
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Removes this replica from the registry and clears its per-bucket
    /// counts on graceful shutdown, crediting back any slots still recorded
    /// as held.
    ///
    /// Sessions aborted by the shutdown grace-period timeout release their
    /// slot from a detached task spawned in `SlotGuard::drop`, which isn't
    /// guaranteed to run before the process exits. Once this replica is
    /// gone from the registry the reaper will never look at it again, so
    /// any slot that detached release didn't get to credit back would
    /// otherwise inflate the global count forever. Reading and zeroing
    /// `replica/<self>/conns` here — the same step `cleanup_dead_replica`
    /// performs for a replica the reaper judges dead — makes this
    /// independent of whether that race was won.
    ///
    /// Best-effort throughout: a failure here just means the reaper will
    /// clean up this replica as if it had crashed.
    pub async fn deregister_self(&self) {
        if self.is_fallback() {
            return;
        }
        let replica = self.config.instance_id();
        let mut conn = match self.store_conn() {
            Ok(c) => c,
            Err(_) => return,
        };

        let held: HashMap<String, i64> = match conn.hgetall(scripts::conns_key(replica)).await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "failed to read replica conns map on shutdown");
                HashMap::new()
            }
        };
        for (bucket_id, n) in &held {
            if *n > 0 {
                if let Err(e) = conn
                    .decr::<_, _, i64>(scripts::count_key(bucket_id), *n)
                    .await
                {
                    warn!(bucket = %bucket_id, error = %e, "failed to credit back held slots on shutdown");
                }
            }
        }

        if let Err(e) = conn.del::<_, ()>(scripts::conns_key(replica)).await {
            warn!(error = %e, "failed to clear replica conns map on shutdown");
        }
        if let Err(e) = conn
            .srem::<_, _, ()>(scripts::REPLICAS_SET_KEY, replica)
            .await
        {
            warn!(error = %e, "failed to remove replica from registry on shutdown");
            return;
        }
        if let Err(e) = conn.del::<_, ()>(scripts::heartbeat_key(replica)).await {
            warn!(error = %e, "failed to clear heartbeat key on shutdown");
        }
        info!(replica, "deregistered from shared store on graceful shutdown");
    }
}
