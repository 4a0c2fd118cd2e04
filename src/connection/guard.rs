// src/connection/guard.rs

//! `SlotGuard` is an RAII guard over one admitted connection slot. Teardown
//! releases it explicitly with a fresh, bounded-timeout context that is
//! independent of the (possibly already canceled) session context; `Drop` is
//! only a safety net for paths that bail out before teardown runs.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::admission::AdmissionQueue;

const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SlotGuard {
    admission: Arc<AdmissionQueue>,
    bucket_id: String,
    released: bool,
}

impl SlotGuard {
    pub fn new(admission: Arc<AdmissionQueue>, bucket_id: String) -> Self {
        Self {
            admission,
            bucket_id,
            released: false,
        }
    }

    /// Releases the slot. A session must never be kept alive because this
    /// failed or timed out — a failure here is logged and left for the
    /// reaper to reclaim once this replica's heartbeat lapses.
    ///
    /// `released` is set only once the call below has run, not before: if
    /// the task calling this is aborted while suspended inside it (e.g. a
    /// forced shutdown past the grace period), `Drop` must still see
    /// `released == false` and fall through to its own fallback release,
    /// since the in-flight one was just canceled mid-flight.
    pub async fn release(mut self) {
        let bucket_id = self.bucket_id.clone();
        if tokio::time::timeout(RELEASE_TIMEOUT, self.admission.release(&bucket_id))
            .await
            .is_err()
        {
            warn!(
                bucket = %bucket_id,
                "slot release timed out; relying on the reaper to reclaim it"
            );
        }
        self.released = true;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let admission = self.admission.clone();
        let bucket_id = self.bucket_id.clone();
        tokio::spawn(async move {
            admission.release(&bucket_id).await;
        });
    }
}
