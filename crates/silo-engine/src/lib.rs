//! The embedded record-table engine.
//!
//! A deliberately small relational core bound to the fixed log-record schema:
//! one table, one prepared insert, WAL journaling with manual checkpoints.
//! Every durable byte moves through the lock adapter; the engine never
//! touches a [`silo_vfs::Volume`] directly, so the lock ladder in the adapter
//! is the only synchronization between this connection and anything else
//! holding the store open.
//!
//! Persisted layout:
//!
//! - `<store>`      checksummed 64-byte header followed by committed rows
//! - `<store>-wal`  committed-but-unfolded frames, one per transaction
//! - `<store>-shm`  coordination side file, contents unused by this engine
//!
//! All three are deleted together by the pipeline's recovery procedure.

mod connection;
mod wal;

pub use connection::{Connection, InsertStatement, InterruptToken, shm_path_for};
pub use wal::WalFile;

use silo_error::{Result, SiloError};
use xxhash_rust::xxh3::xxh3_64;

/// Store header magic.
pub const STORE_MAGIC: [u8; 8] = *b"SILOLOG1";

/// Store format version.
pub const STORE_VERSION: u32 = 1;

/// Encoded header size. Rows start at this offset.
pub const HEADER_SIZE: usize = 64;

const CHECKSUM_OFFSET: usize = 56;

/// The store file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub version: u32,
    pub page_size: u32,
    /// Rows durable in the main store (excludes unfolded WAL frames).
    pub record_count: u64,
}

impl StoreHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            version: STORE_VERSION,
            page_size,
            record_count: 0,
        }
    }

    /// Encode with a trailing xxh3 checksum over everything before it.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&STORE_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.record_count.to_le_bytes());
        let sum = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&sum.to_le_bytes());
        buf
    }

    /// Decode and verify. Any structural mismatch is corruption.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(SiloError::ShortRead {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        if buf[0..8] != STORE_MAGIC {
            return Err(SiloError::corrupt("bad store magic"));
        }
        let stored = u64::from_le_bytes(buf[CHECKSUM_OFFSET..HEADER_SIZE].try_into().unwrap());
        if stored != xxh3_64(&buf[..CHECKSUM_OFFSET]) {
            return Err(SiloError::corrupt("header checksum mismatch"));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != STORE_VERSION {
            return Err(SiloError::corrupt(format!(
                "unsupported store version {version}"
            )));
        }
        Ok(Self {
            version,
            page_size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            record_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}
