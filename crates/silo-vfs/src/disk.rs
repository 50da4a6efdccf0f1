//! `std::fs`-backed volume.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use silo_error::{Result, SiloError};

use crate::traits::{FileAttributes, Volume, VolumeFile};

/// A volume rooted at a directory on the host filesystem.
#[derive(Debug, Clone)]
pub struct DiskVolume {
    root: PathBuf,
}

impl DiskVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn map_not_found(err: std::io::Error, path: &Path) -> SiloError {
        if err.kind() == std::io::ErrorKind::NotFound {
            SiloError::StoreNotFound {
                path: path.to_path_buf(),
            }
        } else {
            SiloError::Io(err)
        }
    }
}

impl Volume for DiskVolume {
    type File = DiskFile;

    fn name(&self) -> &str {
        "disk"
    }

    fn create(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&full)?;
        Ok(())
    }

    fn open(&self, path: &Path, writable: bool) -> Result<Self::File> {
        let full = self.resolve(path);
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&full)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SiloError::StoreNotFound { path: full.clone() },
                std::io::ErrorKind::PermissionDenied => SiloError::ReadOnly,
                _ => SiloError::Io(e),
            })?;
        Ok(DiskFile { file, writable })
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        fs::remove_file(&full).map_err(|e| Self::map_not_found(e, &full))
    }

    fn attributes(&self, path: &Path) -> Result<FileAttributes> {
        let full = self.resolve(path);
        let meta = fs::metadata(&full).map_err(|e| Self::map_not_found(e, &full))?;
        Ok(FileAttributes {
            size: meta.len(),
            read_only: meta.permissions().readonly(),
        })
    }

    fn flush(&self) -> Result<()> {
        // Per-file sync happens in VolumeFile::flush; there is no useful
        // whole-volume barrier on a host filesystem.
        Ok(())
    }

    fn sector_size(&self) -> u32 {
        4096
    }
}

/// Handle to a [`DiskVolume`] file.
#[derive(Debug)]
pub struct DiskFile {
    file: File,
    writable: bool,
}

impl VolumeFile for DiskFile {
    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SiloError::ReadOnly);
        }
        self.file.write_all(buf)?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(SiloError::ReadOnly);
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn preallocate(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        if self.file.metadata()?.len() < len {
            self.file.set_len(len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_write_read() {
        let dir = tempdir().unwrap();
        let vol = DiskVolume::new(dir.path());
        let path = Path::new("a.bin");
        vol.create(path).unwrap();

        let mut f = vol.open(path, true).unwrap();
        f.write(b"hello").unwrap();
        f.flush().unwrap();

        let mut f = vol.open(path, false).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn missing_file_maps_to_not_found() {
        let dir = tempdir().unwrap();
        let vol = DiskVolume::new(dir.path());
        assert!(matches!(
            vol.open(Path::new("missing"), false).unwrap_err(),
            SiloError::StoreNotFound { .. }
        ));
        assert!(matches!(
            vol.delete(Path::new("missing")).unwrap_err(),
            SiloError::StoreNotFound { .. }
        ));
    }

    #[test]
    fn seek_read_at_offset() {
        let dir = tempdir().unwrap();
        let vol = DiskVolume::new(dir.path());
        let path = Path::new("b.bin");
        vol.create(path).unwrap();

        let mut f = vol.open(path, true).unwrap();
        f.write(b"0123456789").unwrap();
        f.seek(4).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(f.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"456");
    }

    #[test]
    fn preallocate_grows_but_never_shrinks() {
        let dir = tempdir().unwrap();
        let vol = DiskVolume::new(dir.path());
        let path = Path::new("c.bin");
        vol.create(path).unwrap();

        let mut f = vol.open(path, true).unwrap();
        f.preallocate(1024).unwrap();
        assert_eq!(f.size().unwrap(), 1024);
        f.preallocate(10).unwrap();
        assert_eq!(f.size().unwrap(), 1024);
    }
}
