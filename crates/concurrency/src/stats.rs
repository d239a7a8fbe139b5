//! Merger counters
//!
//! Cumulative, never reset. Relaxed ordering: the counters are observed
//! for monitoring and tests, never used for synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a merger
#[derive(Debug, Default)]
pub struct MergerStats {
    batches_committed: AtomicU64,
    commands_committed: AtomicU64,
    commands_failed: AtomicU64,
    fatal_aborts: AtomicU64,
    commands_canceled: AtomicU64,
    commands_rejected: AtomicU64,
    largest_batch: AtomicU64,
}

/// Point-in-time copy of [`MergerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergerStatsSnapshot {
    /// Storage transactions committed
    pub batches_committed: u64,
    /// Commands whose effects were committed
    pub commands_committed: u64,
    /// Commands that failed at the command level (batch still committed)
    pub commands_failed: u64,
    /// Batches aborted by a transaction-fatal error
    pub fatal_aborts: u64,
    /// Commands canceled before execution
    pub commands_canceled: u64,
    /// Submissions refused because the queue was full
    pub commands_rejected: u64,
    /// Most commands executed in one batch
    pub largest_batch: u64,
}

impl MergerStats {
    pub(crate) fn record_commit(&self, committed: u64, failed: u64) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.commands_committed.fetch_add(committed, Ordering::Relaxed);
        self.commands_failed.fetch_add(failed, Ordering::Relaxed);
        self.largest_batch.fetch_max(committed + failed, Ordering::Relaxed);
    }

    pub(crate) fn record_fatal_abort(&self, batch_len: u64) {
        self.fatal_aborts.fetch_add(1, Ordering::Relaxed);
        self.largest_batch.fetch_max(batch_len, Ordering::Relaxed);
    }

    pub(crate) fn record_canceled(&self) {
        self.commands_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> MergerStatsSnapshot {
        MergerStatsSnapshot {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            commands_committed: self.commands_committed.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            fatal_aborts: self.fatal_aborts.load(Ordering::Relaxed),
            commands_canceled: self.commands_canceled.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
        }
    }
}
