//! Pipeline counters.
//!
//! Every role increments its own counters with relaxed atomics; readers take
//! a point-in-time snapshot for periodic throughput reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters for the capture/stage/ingest roles.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Records accepted by `capture`.
    pub captured: AtomicU64,
    /// Records written into staged batch files.
    pub staged: AtomicU64,
    /// Records committed into the store.
    pub ingested: AtomicU64,
    /// Records dropped after a non-transient per-row failure.
    pub skipped: AtomicU64,
    /// Staged batch files fully processed.
    pub files_consumed: AtomicU64,
    /// Destructive store rebuilds performed.
    pub recoveries: AtomicU64,
    /// Times the producer was suspended on a full staged-file queue.
    pub producer_suspensions: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_captured(&self, n: u64) {
        self.captured.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_staged(&self, n: u64) {
        self.staged.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_ingested(&self, n: u64) {
        self.ingested.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn file_consumed(&self) {
        self.files_consumed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn producer_suspended(&self) {
        self.producer_suspensions.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            staged: self.staged.load(Ordering::Relaxed),
            ingested: self.ingested.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            files_consumed: self.files_consumed.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            producer_suspensions: self.producer_suspensions.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub staged: u64,
    pub ingested: u64,
    pub skipped: u64,
    pub files_consumed: u64,
    pub recoveries: u64,
    pub producer_suspensions: u64,
}

impl StatsSnapshot {
    /// Records captured but not yet durable in the store.
    pub fn in_flight(&self) -> u64 {
        self.captured
            .saturating_sub(self.ingested + self.skipped)
    }
}
