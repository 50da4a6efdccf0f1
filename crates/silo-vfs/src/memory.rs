//! In-memory volume for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use silo_error::{Result, SiloError};

use crate::traits::{FileAttributes, Volume, VolumeFile};

#[derive(Debug, Default)]
struct FileData {
    data: Vec<u8>,
    read_only: bool,
}

#[derive(Debug, Default)]
struct MemoryVolumeInner {
    files: HashMap<PathBuf, Arc<Mutex<FileData>>>,
}

/// A volume whose files live in process memory.
///
/// All handles to the same path share one byte store, so concurrent-handle
/// behavior matches a real volume. Cloning the volume shares the same file
/// set.
#[derive(Debug, Clone, Default)]
pub struct MemoryVolume {
    inner: Arc<Mutex<MemoryVolumeInner>>,
}

impl MemoryVolume {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a path read-only so write opens are refused. Test hook.
    pub fn set_read_only(&self, path: &Path, read_only: bool) {
        if let Some(f) = self.inner.lock().files.get(path) {
            f.lock().read_only = read_only;
        }
    }

    /// Number of files currently on the volume. Test hook.
    pub fn file_count(&self) -> usize {
        self.inner.lock().files.len()
    }
}

impl Volume for MemoryVolume {
    type File = MemoryFile;

    fn name(&self) -> &str {
        "memory"
    }

    fn create(&self, path: &Path) -> Result<()> {
        self.inner
            .lock()
            .files
            .entry(path.to_path_buf())
            .or_default();
        Ok(())
    }

    fn open(&self, path: &Path, writable: bool) -> Result<Self::File> {
        let inner = self.inner.lock();
        let storage = inner
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SiloError::StoreNotFound {
                path: path.to_path_buf(),
            })?;
        if writable && storage.lock().read_only {
            return Err(SiloError::ReadOnly);
        }
        Ok(MemoryFile {
            storage,
            pos: 0,
            writable,
        })
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.inner
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| SiloError::StoreNotFound {
                path: path.to_path_buf(),
            })
    }

    fn attributes(&self, path: &Path) -> Result<FileAttributes> {
        let inner = self.inner.lock();
        let storage = inner
            .files
            .get(path)
            .ok_or_else(|| SiloError::StoreNotFound {
                path: path.to_path_buf(),
            })?;
        let f = storage.lock();
        Ok(FileAttributes {
            size: f.data.len() as u64,
            read_only: f.read_only,
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle to a [`MemoryVolume`] file.
#[derive(Debug)]
pub struct MemoryFile {
    storage: Arc<Mutex<FileData>>,
    pos: u64,
    writable: bool,
}

impl VolumeFile for MemoryFile {
    fn seek(&mut self, offset: u64) -> Result<()> {
        self.pos = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let f = self.storage.lock();
        let len = f.data.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(f.data.len() - start);
        buf[..n].copy_from_slice(&f.data[start..start + n]);
        drop(f);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SiloError::ReadOnly);
        }
        let mut f = self.storage.lock();
        let end = self.pos as usize + buf.len();
        if f.data.len() < end {
            f.data.resize(end, 0);
        }
        let start = self.pos as usize;
        f.data[start..end].copy_from_slice(buf);
        drop(f);
        self.pos = end as u64;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(SiloError::ReadOnly);
        }
        let mut f = self.storage.lock();
        f.data.truncate(len as usize);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.storage.lock().data.len() as u64)
    }

    fn preallocate(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(SiloError::ReadOnly);
        }
        let mut f = self.storage.lock();
        if (f.data.len() as u64) < len {
            f.data.resize(len as usize, 0);
        }
        Ok(())
    }
}
