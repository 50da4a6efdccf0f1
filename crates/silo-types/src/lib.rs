pub mod config;
pub mod flags;
pub mod record;
pub mod stats;

pub use config::{EngineTuning, IngestStrategy, PipelineConfig, SynchronousMode};
pub use flags::{AccessCheck, FileControl, OpenFlags, SyncFlags};
pub use record::{LogRecord, RECORD_SIZE, Severity};
pub use stats::{PipelineStats, StatsSnapshot};

use std::fmt;

/// The five-level file lock ladder.
///
/// Levels are totally ordered; escalation is stepwise through the ladder and
/// at most one holder may be at `Reserved` or above on a given file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared read lock; many handles may hold this concurrently.
    Shared = 1,
    /// Intent-to-write. Readers may still join; at most one holder.
    Reserved = 2,
    /// Write pending; blocks new readers while existing ones drain.
    Pending = 3,
    /// Sole access. Required for writes to main store files.
    Exclusive = 4,
}

impl LockLevel {
    /// Lock levels at or above `Reserved` carry write intent and are
    /// single-holder.
    #[inline]
    pub const fn is_write_intent(self) -> bool {
        self as u8 >= Self::Reserved as u8
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Shared => "SHARED",
            Self::Reserved => "RESERVED",
            Self::Pending => "PENDING",
            Self::Exclusive => "EXCLUSIVE",
        };
        f.write_str(name)
    }
}

/// Checkpoint modes accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointMode {
    /// Fold what can be folded without blocking writers.
    Passive,
    /// Fold everything and reset the WAL file to zero length.
    Truncate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_level_ordering() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
    }

    #[test]
    fn write_intent_boundary() {
        assert!(!LockLevel::None.is_write_intent());
        assert!(!LockLevel::Shared.is_write_intent());
        assert!(LockLevel::Reserved.is_write_intent());
        assert!(LockLevel::Pending.is_write_intent());
        assert!(LockLevel::Exclusive.is_write_intent());
    }

    #[test]
    fn lock_level_display() {
        assert_eq!(LockLevel::None.to_string(), "NONE");
        assert_eq!(LockLevel::Exclusive.to_string(), "EXCLUSIVE");
    }
}
