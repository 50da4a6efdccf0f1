//! Pipeline and engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pipeline configuration
// ---------------------------------------------------------------------------

/// Which consumer runs downstream of the capture buffers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestStrategy {
    /// Stage each filled buffer to a raw batch file, ingest from files.
    /// Favors capture throughput; survives engine stalls.
    #[default]
    Staged,
    /// Ingest each filled buffer straight into the engine, one transaction
    /// per buffer. Favors integrity; capture blocks on engine latency.
    Direct,
}

/// Configuration for the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records per staging buffer. Capture blocks after 2x this many
    /// records are outstanding with no consumer progress.
    ///
    /// Default: 16384.
    pub buffer_capacity: usize,

    /// Records copied and written per chunk while staging and ingesting.
    ///
    /// Default: 512.
    pub chunk_records: usize,

    /// Bound on staged batch files awaiting ingestion. Batch file names
    /// are recycled modulo this value, so occupancy must never exceed it.
    ///
    /// Default: 40.
    pub max_queued_files: usize,

    /// Passive checkpoint cadence, counted in committed chunks (staged
    /// strategy) or buffers (direct strategy).
    ///
    /// Default: 5.
    pub checkpoint_every: u64,

    /// Delay before retrying a failed store reopen during recovery.
    ///
    /// Default: 1s.
    pub reopen_backoff: Duration,

    /// Completion timeout for an accelerated bulk copy before falling back
    /// to a plain copy.
    ///
    /// Default: 1s.
    pub bulk_copy_timeout: Duration,

    /// Delete the store, its side files, and any leftover batch files at
    /// launch, starting the appliance from an empty log.
    ///
    /// Default: false.
    pub fresh_start: bool,

    /// Which consumer strategy to run.
    pub strategy: IngestStrategy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 16384,
            chunk_records: 512,
            max_queued_files: 40,
            checkpoint_every: 5,
            reopen_backoff: Duration::from_secs(1),
            bulk_copy_timeout: Duration::from_secs(1),
            fresh_start: false,
            strategy: IngestStrategy::Staged,
        }
    }
}

impl PipelineConfig {
    /// Validate and clamp configuration values.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.buffer_capacity == 0 {
            self.buffer_capacity = 1;
        }
        if self.chunk_records == 0 {
            self.chunk_records = 1;
        }
        if self.chunk_records > self.buffer_capacity {
            self.chunk_records = self.buffer_capacity;
        }
        if self.max_queued_files == 0 {
            self.max_queued_files = 1;
        }
        if self.checkpoint_every == 0 {
            self.checkpoint_every = 1;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Engine tuning
// ---------------------------------------------------------------------------

/// Durability barrier policy for the engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronousMode {
    /// No sync calls; durability rides on the volume flush at batch
    /// boundaries. The appliance's default for ingest throughput.
    #[default]
    Off,
    /// Sync at commit.
    Normal,
    /// Sync at commit and checkpoint.
    Full,
}

/// Per-connection tuning applied at open and re-applied after recovery.
///
/// Mirrors the fixed pragma block the appliance uses: WAL journaling with
/// manual checkpointing, a bounded page cache, exclusive locking for the
/// single-writer ingest connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTuning {
    /// Page size in bytes for store and WAL blocks.
    ///
    /// Default: 4096.
    pub page_size: u32,

    /// Durability barrier policy. Default: `Off`.
    pub synchronous: SynchronousMode,

    /// Soft budget in bytes for rows buffered by an open transaction.
    /// Exceeding it surfaces out-of-memory so the caller can release and
    /// retry.
    ///
    /// Default: 4 MiB.
    pub cache_budget: u64,

    /// WAL size at which a truncating checkpoint is worthwhile.
    ///
    /// Default: 4 MiB.
    pub journal_size_limit: u64,

    /// Keep the connection's Exclusive lock across transactions.
    ///
    /// Default: true. The ingest connection is the only writer.
    pub exclusive_locking: bool,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            page_size: 4096,
            synchronous: SynchronousMode::Off,
            cache_budget: 4 * 1024 * 1024,
            journal_size_limit: 4 * 1024 * 1024,
            exclusive_locking: true,
        }
    }
}

impl EngineTuning {
    /// Validate and clamp tuning values.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if !self.page_size.is_power_of_two() || self.page_size < 512 || self.page_size > 65536 {
            self.page_size = 4096;
        }
        if self.cache_budget < 64 * 1024 {
            self.cache_budget = 64 * 1024;
        }
        self
    }
}
