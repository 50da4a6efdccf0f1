//! Write-ahead log file.
//!
//! One frame per committed transaction:
//!
//! ```text
//! +----------------+----------------+----------------------+
//! | count; u32 LE  | reserved; u32  | xxh3(payload); u64   |
//! +----------------+----------------+----------------------+
//! | payload: count fixed-stride records                    |
//! +--------------------------------------------------------+
//! ```
//!
//! On open the file is scanned front to back; the first frame that fails its
//! length or checksum marks a torn tail from an interrupted commit, and the
//! file is truncated there. A checkpoint folds every frame into the main
//! store and resets the log to zero length.

use std::path::{Path, PathBuf};

use silo_error::Result;
use silo_types::record::RECORD_SIZE;
use silo_types::{LogRecord, OpenFlags, SyncFlags};
use silo_vfs::{AdapterFile, LockAdapter, Volume};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

const FRAME_HEADER_SIZE: usize = 16;

/// An open WAL file with its unfolded frames cached in memory.
#[derive(Debug)]
pub struct WalFile<V: Volume> {
    file: AdapterFile<V>,
    records: Vec<LogRecord>,
    end_offset: u64,
}

impl<V: Volume> WalFile<V> {
    /// WAL path for a store path.
    pub fn path_for(store: &Path) -> PathBuf {
        let mut s = store.as_os_str().to_os_string();
        s.push("-wal");
        PathBuf::from(s)
    }

    /// Open (creating if needed) and recover the frame list, discarding any
    /// torn tail.
    pub fn open(adapter: &LockAdapter<V>, store_path: &Path) -> Result<Self> {
        let path = Self::path_for(store_path);
        let mut file = adapter.open(
            Some(&path),
            OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::JOURNAL,
        )?;

        let size = file.size()?;
        let mut records = Vec::new();
        let mut offset = 0u64;
        while offset < size {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            if file.read(offset, &mut header)? < FRAME_HEADER_SIZE {
                break;
            }
            let count = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
            let stored_sum = u64::from_le_bytes(header[8..16].try_into().unwrap());
            // A header claiming more rows than the file holds is a torn
            // tail; sizing the buffer from it would demand absurd memory.
            let payload_len = count * RECORD_SIZE as u64;
            if payload_len > size - offset - FRAME_HEADER_SIZE as u64 {
                break;
            }
            let payload_len = payload_len as usize;
            let mut payload = vec![0u8; payload_len];
            if file.read(offset + FRAME_HEADER_SIZE as u64, &mut payload)? < payload_len {
                break;
            }
            if xxh3_64(&payload) != stored_sum {
                break;
            }
            for chunk in payload.chunks_exact(RECORD_SIZE) {
                records.push(LogRecord::decode_from(chunk)?);
            }
            offset += (FRAME_HEADER_SIZE + payload_len) as u64;
        }

        if offset < size {
            warn!(path = %path.display(), valid = offset, size, "discarding torn WAL tail");
            file.truncate(offset)?;
        }
        debug!(path = %path.display(), records = records.len(), "opened WAL");
        Ok(Self {
            file,
            records,
            end_offset: offset,
        })
    }

    /// Append one commit frame. `sync` forces the frame to media before
    /// returning.
    pub fn append_frame(&mut self, rows: &[LogRecord], sync: bool) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let payload_len = rows.len() * RECORD_SIZE;
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + payload_len];
        for (i, row) in rows.iter().enumerate() {
            row.encode_into(&mut buf[FRAME_HEADER_SIZE + i * RECORD_SIZE..]);
        }
        let sum = xxh3_64(&buf[FRAME_HEADER_SIZE..]);
        buf[0..4].copy_from_slice(&(rows.len() as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&sum.to_le_bytes());

        self.file.write(self.end_offset, &buf)?;
        if sync {
            self.file.sync(SyncFlags::NORMAL)?;
        }
        self.end_offset += buf.len() as u64;
        self.records.extend_from_slice(rows);
        Ok(())
    }

    /// Committed rows not yet folded into the main store, in commit order.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Current log length in bytes.
    pub fn size(&self) -> u64 {
        self.end_offset
    }

    /// Drop all frames after a checkpoint folded them.
    pub fn reset(&mut self) -> Result<()> {
        self.file.truncate(0)?;
        self.end_offset = 0;
        self.records.clear();
        Ok(())
    }

    /// Close the underlying handle.
    pub fn close(self) -> Result<()> {
        self.file.close()
    }
}
