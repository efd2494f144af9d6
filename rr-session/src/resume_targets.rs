// Memoizes where resume-family commands lead from each point. Anything
// that can change stepping behavior (breakpoints, blackboxing) runs as an
// invalidation transaction: the cache is cleared, the epoch advances, and
// every write is gated on the epoch captured before its RPC was issued,
// so a slow response from before the invalidation can never land.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use protocol::{ExecutionPoint, PointDescription, ResumeCommand};
use tokio::sync::Notify;
use tracing::debug;

use crate::logging::category_step;

type TargetKey = (ExecutionPoint, ResumeCommand);

pub struct ResumeTargetCache {
    targets: Mutex<HashMap<TargetKey, PointDescription>>,
    epoch: AtomicU64,
    pending_invalidations: AtomicUsize,
    settled: Notify,
}

impl ResumeTargetCache {
    pub fn new() -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            pending_invalidations: AtomicUsize::new(0),
            settled: Notify::new(),
        }
    }

    fn targets(&self) -> MutexGuard<'_, HashMap<TargetKey, PointDescription>> {
        self.targets.lock().expect("resume target lock poisoned")
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn lookup(
        &self,
        point: &ExecutionPoint,
        command: ResumeCommand,
    ) -> Option<PointDescription> {
        self.targets().get(&(point.clone(), command)).cloned()
    }

    /// Stores a resolved target unless the epoch advanced since `epoch`
    /// was captured; stale results are dropped silently. Returns whether
    /// the write landed.
    pub fn store_if_current(
        &self,
        epoch: u64,
        point: &ExecutionPoint,
        command: ResumeCommand,
        target: PointDescription,
    ) -> bool {
        let mut targets = self.targets();
        if self.epoch() != epoch {
            debug!(
                "{} dropping stale target for {point} {:?}",
                category_step(),
                command
            );
            return false;
        }
        targets.insert((point.clone(), command), target);
        true
    }

    /// Begins an invalidating operation: clears the cache, advances the
    /// epoch, and counts the operation as in flight until `finish` is
    /// called. Multiple transactions may overlap; the cache settles when
    /// the last one finishes.
    pub fn begin_invalidation(&self) -> InvalidationTxn<'_> {
        // Clear under the lock but bump the epoch with it held, so no
        // store under the old epoch can slip in between.
        let mut targets = self.targets();
        targets.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.pending_invalidations.fetch_add(1, Ordering::SeqCst);
        drop(targets);
        InvalidationTxn {
            cache: self,
            finished: false,
        }
    }

    pub fn has_pending_invalidations(&self) -> bool {
        self.pending_invalidations.load(Ordering::SeqCst) > 0
    }

    /// Resolves once no invalidating operation is in flight.
    pub async fn wait_for_invalidations_to_settle(&self) {
        let mut notified = pin!(self.settled.notified());
        loop {
            if !self.has_pending_invalidations() {
                return;
            }
            notified.as_mut().enable();
            if !self.has_pending_invalidations() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.settled.notified());
        }
    }

    fn release(&self) -> bool {
        let remaining = self.pending_invalidations.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.settled.notify_waiters();
            true
        } else {
            false
        }
    }
}

impl Default for ResumeTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Open invalidating operation. Call `finish` when the backend work it
/// covers has completed; `true` means this was the last in-flight
/// invalidation and speculative precaching may restart.
pub struct InvalidationTxn<'a> {
    cache: &'a ResumeTargetCache,
    finished: bool,
}

impl InvalidationTxn<'_> {
    pub fn finish(mut self) -> bool {
        self.finished = true;
        self.cache.release()
    }
}

impl Drop for InvalidationTxn<'_> {
    fn drop(&mut self) {
        // Safety net for early exits; settle accounting must not leak.
        if !self.finished {
            self.cache.release();
        }
    }
}
