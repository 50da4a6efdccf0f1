//! Storage core for an embedded data-logging appliance.
//!
//! The pieces, bottom up:
//!
//! - [`Volume`] and [`VolumeFile`] describe the storage media;
//!   [`MemoryVolume`] and [`DiskVolume`] implement it.
//! - [`LockAdapter`] layers the five-level lock ladder and a path-keyed
//!   open-file registry over a volume, giving the engine database-grade
//!   locking semantics without OS byte-range locks.
//! - [`Connection`] is the record-table engine: a checksummed store file,
//!   a write-ahead side file, one fixed schema, one prepared insert.
//! - [`Pipeline`] is the capture path: double-buffered capture, raw batch
//!   staging, chunked ingestion, destructive recovery when the store goes
//!   bad.
//!
//! ```no_run
//! use logsilo::{DiskVolume, EngineTuning, LogRecord, Pipeline, PipelineConfig, Severity};
//!
//! # fn main() -> logsilo::Result<()> {
//! let volume = DiskVolume::new("/var/lib/logsilo");
//! let mut pipeline = Pipeline::launch(
//!     volume,
//!     "logs.db",
//!     PipelineConfig::default(),
//!     EngineTuning::default(),
//! )?;
//! pipeline.capture(LogRecord::new(0, 42, Severity::Info, "boot", "power on")?);
//! let receipt = pipeline.shutdown();
//! assert_eq!(receipt.ingested, 1);
//! # Ok(())
//! # }
//! ```

pub use silo_error::{ErrorCode, Result, SiloError};

pub use silo_types::{
    CheckpointMode, EngineTuning, IngestStrategy, LockLevel, LogRecord, PipelineConfig,
    PipelineStats, Severity, StatsSnapshot, SynchronousMode,
};
pub use silo_types::flags::{AccessCheck, FileControl, OpenFlags, SyncFlags};
pub use silo_types::record::{CATEGORY_LEN, MESSAGE_LEN, RECORD_SIZE};

pub use silo_vfs::{
    AdapterFile, ControlReply, DiskVolume, FileAttributes, LockAdapter, MemoryVolume, Volume,
    VolumeFile,
};

pub use silo_engine::{Connection, InsertStatement, InterruptToken};

pub use silo_pipeline::{BulkCopy, Pipeline, Session, SoftwareCopy, recover_store};
