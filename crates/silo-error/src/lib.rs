use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for logsilo storage operations.
///
/// Every volume-backend failure is translated into one of these variants at
/// the lock-adapter boundary; backend-specific status values never cross it.
#[derive(Error, Debug)]
pub enum SiloError {
    // === Store Errors ===
    /// Store file not found.
    #[error("store not found: '{path}'")]
    StoreNotFound { path: PathBuf },

    /// Store file is locked by another holder.
    #[error("store is locked: '{path}'")]
    StoreLocked { path: PathBuf },

    /// Store file is corrupt.
    #[error("store image is malformed: {detail}")]
    StoreCorrupt { detail: String },

    /// File exists but does not carry a valid store header.
    #[error("file is not a log store: '{path}'")]
    NotAStore { path: PathBuf },

    /// Write attempted on a handle opened read-only.
    #[error("attempt to write a readonly store")]
    ReadOnly,

    // === I/O Errors ===
    /// Volume I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Volume-level I/O failure with context.
    #[error("volume I/O error during {op}: {detail}")]
    VolumeIo { op: &'static str, detail: String },

    /// Structural read returned fewer bytes than the format requires.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Cannot open file.
    #[error("unable to open store file: '{path}'")]
    CannotOpen { path: PathBuf },

    // === Locking Errors ===
    /// Lock cannot be granted right now; the caller may retry.
    #[error("store is busy")]
    Busy,

    /// Lock request that violates the escalation protocol.
    #[error("lock protocol violation: {detail}")]
    LockProtocol { detail: String },

    // === Transaction Errors ===
    /// Cannot start a transaction within a transaction.
    #[error("cannot start a transaction within a transaction")]
    NestedTransaction,

    /// No transaction is active.
    #[error("cannot commit - no transaction is active")]
    NoActiveTransaction,

    /// WAL checkpoint failed.
    #[error("checkpoint failed: {detail}")]
    CheckpointFailed { detail: String },

    // === Record Errors ===
    /// A staged file's length is not a whole multiple of the record stride.
    #[error("staged batch is truncated: {len} bytes is not a record multiple")]
    TruncatedBatch { len: u64 },

    /// Field value does not fit the fixed wire layout.
    #[error("record field {field} exceeds its fixed width")]
    FieldTooLong { field: &'static str },

    // === Resource Errors ===
    /// Engine memory budget exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// Operation cancelled by interrupt.
    #[error("operation interrupted")]
    Interrupted,

    // === Internal Errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation is not supported by the current backend or configuration.
    #[error("unsupported operation")]
    Unsupported,
}

/// Numeric status codes for the adapter boundary.
///
/// The values follow the classic embedded-database convention so that
/// diagnostics stay comparable across ports of this component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Callback requested abort.
    Abort = 4,
    /// Store is locked.
    Busy = 5,
    /// Out of memory.
    NoMem = 7,
    /// Attempt to write a read-only store.
    ReadOnly = 8,
    /// Interrupted.
    Interrupt = 9,
    /// Disk I/O error.
    IoErr = 10,
    /// Store image is malformed.
    Corrupt = 11,
    /// Not found (internal).
    NotFound = 12,
    /// Unable to open store file.
    CantOpen = 14,
    /// Locking protocol error.
    Protocol = 15,
    /// Short read.
    ShortRead = 522,
}

impl SiloError {
    /// Map this error to the numeric status code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::StoreNotFound { .. } => ErrorCode::NotFound,
            Self::CannotOpen { .. } => ErrorCode::CantOpen,
            Self::StoreLocked { .. } | Self::Busy => ErrorCode::Busy,
            Self::StoreCorrupt { .. } | Self::NotAStore { .. } | Self::TruncatedBatch { .. } => {
                ErrorCode::Corrupt
            }
            Self::Io(_) | Self::VolumeIo { .. } | Self::CheckpointFailed { .. } => ErrorCode::IoErr,
            Self::ShortRead { .. } => ErrorCode::ShortRead,
            Self::LockProtocol { .. } => ErrorCode::Protocol,
            Self::NestedTransaction | Self::NoActiveTransaction | Self::FieldTooLong { .. } => {
                ErrorCode::Error
            }
            Self::OutOfMemory => ErrorCode::NoMem,
            Self::Interrupted => ErrorCode::Interrupt,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Unsupported => ErrorCode::Error,
            Self::ReadOnly => ErrorCode::ReadOnly,
        }
    }

    /// Whether this is a transient condition that may succeed on retry.
    ///
    /// Transient errors are the only ones the pipeline retries in place;
    /// everything else either skips the row or triggers recovery.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::StoreLocked { .. } | Self::OutOfMemory
        )
    }

    /// Whether this error indicates on-media corruption.
    ///
    /// Corruption is the pipeline's recovery trigger: rollback, rebuild the
    /// store, abandon the current staged file.
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::StoreCorrupt { .. } | Self::NotAStore { .. } | Self::TruncatedBatch { .. }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::StoreNotFound { .. } => Some("Check the path or let the pipeline create it"),
            Self::StoreLocked { .. } | Self::Busy => {
                Some("Retry the operation after a short delay")
            }
            Self::StoreCorrupt { .. } | Self::NotAStore { .. } => {
                Some("Run recovery to rebuild the store")
            }
            Self::OutOfMemory => Some("Release cached memory and retry once"),
            _ => None,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::StoreCorrupt {
            detail: detail.into(),
        }
    }

    /// Create a lock protocol violation.
    pub fn lock_protocol(detail: impl Into<String>) -> Self {
        Self::LockProtocol {
            detail: detail.into(),
        }
    }

    /// Create a volume I/O error with the failing operation named.
    pub fn volume_io(op: &'static str, detail: impl Into<String>) -> Self {
        Self::VolumeIo {
            op,
            detail: detail.into(),
        }
    }
}

/// Result type alias using `SiloError`.
pub type Result<T> = std::result::Result<T, SiloError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SiloError::corrupt("bad header checksum");
        assert_eq!(
            err.to_string(),
            "store image is malformed: bad header checksum"
        );
    }

    #[test]
    fn error_display_short_read() {
        let err = SiloError::ShortRead {
            expected: 224,
            actual: 100,
        };
        assert_eq!(err.to_string(), "short read: expected 224 bytes, got 100");
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(SiloError::Busy.error_code(), ErrorCode::Busy);
        assert_eq!(SiloError::corrupt("").error_code(), ErrorCode::Corrupt);
        assert_eq!(SiloError::OutOfMemory.error_code(), ErrorCode::NoMem);
        assert_eq!(
            SiloError::lock_protocol("x").error_code(),
            ErrorCode::Protocol
        );
        assert_eq!(
            SiloError::StoreNotFound {
                path: PathBuf::from("logs.db")
            }
            .error_code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn is_transient() {
        assert!(SiloError::Busy.is_transient());
        assert!(SiloError::OutOfMemory.is_transient());
        assert!(!SiloError::corrupt("x").is_transient());
        assert!(!SiloError::lock_protocol("x").is_transient());
    }

    #[test]
    fn is_corruption() {
        assert!(SiloError::corrupt("x").is_corruption());
        assert!(SiloError::TruncatedBatch { len: 100 }.is_corruption());
        assert!(!SiloError::Busy.is_corruption());
        assert!(!SiloError::OutOfMemory.is_corruption());
    }

    #[test]
    fn suggestions() {
        assert!(SiloError::Busy.suggestion().is_some());
        assert!(SiloError::corrupt("x").suggestion().is_some());
        assert!(SiloError::Unsupported.suggestion().is_none());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: SiloError = io_err.into();
        assert!(matches!(err, SiloError::Io(_)));
        assert_eq!(err.error_code(), ErrorCode::IoErr);
    }

    #[test]
    fn error_code_values() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::Busy as i32, 5);
        assert_eq!(ErrorCode::Corrupt as i32, 11);
        assert_eq!(ErrorCode::ShortRead as i32, 522);
    }
}
