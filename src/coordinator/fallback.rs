// src/coordinator/fallback.rs

//! In-memory admission used while the shared store is unreachable. Each
//! replica enforces a conservative slice of a bucket's global cap rather than
//! refusing all traffic, trading fleet-wide precision for availability.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Holds, per bucket, how many connections *this* replica believes it is
/// currently holding while the store is unreachable.
#[derive(Default)]
pub struct FallbackCounts {
    inner: Mutex<HashMap<String, u32>>,
}

impl FallbackCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// `local_cap` is `max / divisor`, floored to at least 1 by the caller.
    /// Returns `Some(new_local_count)` on success, `None` if the local cap
    /// is already reached.
    pub fn try_acquire(&self, bucket_id: &str, local_cap: u32) -> Option<u32> {
        let mut guard = self.inner.lock();
        let entry = guard.entry(bucket_id.to_string()).or_insert(0);
        if *entry >= local_cap {
            return None;
        }
        *entry += 1;
        Some(*entry)
    }

    pub fn release(&self, bucket_id: &str) {
        let mut guard = self.inner.lock();
        if let Some(count) = guard.get_mut(bucket_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Snapshots the current local counts, e.g. to reconcile into the shared
    /// store's `replica/<self>/conns` map once connectivity is restored.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.inner.lock().clone()
    }

    /// Clears every bucket's local count to zero, keeping the bucket
    /// entries (and so their observed-bucket set) intact.
    ///
    /// Once the snapshot has been reconciled into the store, responsibility
    /// for those connections' slots moves to `replica/<self>/conns`; ongoing
    /// sessions admitted during fallback release through the store path
    /// from then on (`Coordinator::release` checks live fallback state at
    /// release time, not at acquire time), so this map must not keep
    /// counting them or a later fallback episode would start from stale
    /// numbers instead of zero.
    pub fn reset(&self) {
        for count in self.inner.lock().values_mut() {
            *count = 0;
        }
    }
}

/// `max / divisor`, floored to 1 so a fully-partitioned fleet can still make
/// some progress rather than wedging every replica at zero.
pub fn local_cap(max: u32, divisor: u32) -> u32 {
    (max / divisor.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_cap_floors_to_one() {
        assert_eq!(local_cap(2, 10), 1);
        assert_eq!(local_cap(10, 3), 3);
    }

    #[test]
    fn acquire_blocks_once_local_cap_reached() {
        let counts = FallbackCounts::new();
        assert_eq!(counts.try_acquire("b1", 2), Some(1));
        assert_eq!(counts.try_acquire("b1", 2), Some(2));
        assert_eq!(counts.try_acquire("b1", 2), None);
        counts.release("b1");
        assert_eq!(counts.try_acquire("b1", 2), Some(2));
    }

    #[test]
    fn reset_zeroes_counts_without_forgetting_buckets() {
        let counts = FallbackCounts::new();
        counts.try_acquire("b1", 2);
        counts.try_acquire("b1", 2);
        counts.reset();
        assert_eq!(counts.snapshot().get("b1"), Some(&0));
        assert_eq!(counts.try_acquire("b1", 2), Some(1));
    }
}
