//! The VolumeIO contract.
//!
//! Backends expose a deliberately narrow, cursor-based surface modeled on
//! embedded FAT filesystems: a file has one seek position and reads/writes
//! advance it. The adapter owns the locking needed to make seek+transfer
//! atomic; backends only promise that single calls are well-formed.

use std::path::Path;

use silo_error::Result;

/// Metadata for a path on a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    /// File length in bytes.
    pub size: u64,
    /// Whether the volume will refuse write opens for this path.
    pub read_only: bool,
}

/// A mounted volume.
///
/// Implementations must be shareable across threads; per-file state lives in
/// the [`VolumeFile`] handles they hand out.
pub trait Volume: Send + Sync + 'static {
    type File: VolumeFile + std::fmt::Debug;

    /// Volume name for diagnostics.
    fn name(&self) -> &str;

    /// Create an empty file. Creating an already-existing path succeeds and
    /// leaves the existing content alone.
    fn create(&self, path: &Path) -> Result<()>;

    /// Open an existing file. `writable` requests a handle that accepts
    /// writes; volumes may refuse with a read-only error.
    fn open(&self, path: &Path, writable: bool) -> Result<Self::File>;

    /// Remove a file. Missing paths report not-found.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Metadata probe. Missing paths report not-found.
    fn attributes(&self, path: &Path) -> Result<FileAttributes>;

    /// Flush volume-level buffers to media.
    fn flush(&self) -> Result<()>;

    /// Drop any volume-level read caches. Best-effort.
    fn invalidate_cache(&self) {}

    /// Native transfer granularity in bytes.
    fn sector_size(&self) -> u32 {
        512
    }
}

/// An open file on a volume. One seek cursor per handle.
pub trait VolumeFile: Send {
    /// Position the cursor. Seeking past end-of-file is allowed; the gap
    /// materializes only when written.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Read up to `buf.len()` bytes at the cursor, advancing it. Returns the
    /// byte count actually read; 0 at end-of-file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` at the cursor, advancing it.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Cut the file to `len` bytes.
    fn truncate(&mut self, len: u64) -> Result<()>;

    /// Push this file's dirty data to media.
    fn flush(&mut self) -> Result<()>;

    /// Current file length in bytes.
    fn size(&self) -> Result<u64>;

    /// Best-effort space reservation up to `len` bytes. Backends with no
    /// preallocation support succeed without doing anything.
    fn preallocate(&mut self, _len: u64) -> Result<()> {
        Ok(())
    }
}
