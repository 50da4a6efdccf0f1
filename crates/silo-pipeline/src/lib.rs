//! The double-buffered capture pipeline.
//!
//! Three roles, three threads at most:
//!
//! - the producer captures records into one of two staging buffers, swapping
//!   to the other when the active one fills;
//! - the stager drains published buffers into raw batch files on a modular
//!   file queue (staged strategy only);
//! - the ingestor folds batch files, or whole buffers in the direct
//!   strategy, into the record store in chunked transactions.
//!
//! Buffer lifecycle state is carried by ownership rather than flags: a
//! buffer is Filling while the producer holds it, Ready while queued, Free
//! while parked in its handoff slot. The producer blocks once it is two full
//! buffers ahead of the consumer, which bounds capture memory no matter how
//! slow the store is.
//!
//! A corrupt store is rebuilt empty and ingestion continues; see
//! [`recover_store`].

mod buffer;
mod bulk;
mod handoff;
mod ingest;
mod pipeline;
mod recovery;
mod stager;

pub use buffer::{FreeSlots, Producer, Slot, StagingBuffer};
pub use bulk::{BulkCopy, CopyError, SoftwareCopy, copy_with_fallback};
pub use handoff::{CountingSignal, Gate, Handoff, RawBatchQueue, ReadyQueue};
pub use ingest::{DirectIngestor, StagedIngestor};
pub use pipeline::Pipeline;
pub use recovery::{Session, recover_store};
pub use stager::BatchStager;
