//! Engine connection lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use silo_error::{Result, SiloError};
use silo_types::record::RECORD_SIZE;
use silo_types::flags::FileControl;
use silo_types::{
    CheckpointMode, EngineTuning, LockLevel, LogRecord, OpenFlags, SyncFlags, SynchronousMode,
};
use silo_vfs::{AdapterFile, LockAdapter, Volume};
use tracing::{debug, info, warn};

use crate::wal::WalFile;
use crate::{HEADER_SIZE, StoreHeader};

// Checkpoint folds rows into the main store through a bounded buffer.
const FOLD_CHUNK_RECORDS: usize = 512;

/// Shared-memory side file path for a store path.
pub fn shm_path_for(store: &Path) -> PathBuf {
    let mut s = store.as_os_str().to_os_string();
    s.push("-shm");
    PathBuf::from(s)
}

/// Cancellation token for a connection, usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken(Arc<AtomicBool>);

impl InterruptToken {
    /// Request that the connection abort its current work at the next
    /// cancellation point.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// A prepared insert bound to the log-record schema.
///
/// Finalize before tearing the connection down; recovery does this first.
#[derive(Debug)]
pub struct InsertStatement {
    _private: (),
}

impl InsertStatement {
    /// Release the statement.
    pub fn finalize(self) {}
}

/// A single-writer connection to one store file.
pub struct Connection<V: Volume> {
    adapter: LockAdapter<V>,
    path: PathBuf,
    main: AdapterFile<V>,
    wal: WalFile<V>,
    tuning: EngineTuning,
    header: Option<StoreHeader>,
    txn: Option<Vec<LogRecord>>,
    // Stand-in for the page cache: rows retained from committed
    // transactions, charged against `cache_budget` until released.
    row_cache: Vec<LogRecord>,
    interrupt: InterruptToken,
}

impl<V: Volume> Connection<V> {
    /// Open a connection, creating the store file and its side files if
    /// absent. The schema itself is created separately and idempotently by
    /// [`Connection::create_schema`].
    pub fn open(adapter: &LockAdapter<V>, path: &Path, tuning: EngineTuning) -> Result<Self> {
        let tuning = tuning.validated();
        let mut main = adapter.open(
            Some(path),
            OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MAIN_STORE,
        )?;
        main.lock(LockLevel::Shared)?;

        let size = main.size()?;
        let header = if size == 0 {
            None
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            if main.read(0, &mut buf)? < HEADER_SIZE {
                return Err(SiloError::corrupt("store smaller than its header"));
            }
            let header = StoreHeader::decode(&buf)?;
            let expect = HEADER_SIZE as u64 + header.record_count * RECORD_SIZE as u64;
            if size < expect {
                return Err(SiloError::corrupt(format!(
                    "row region truncated: {size} bytes, header claims {expect}"
                )));
            }
            Some(header)
        };

        let wal = WalFile::open(adapter, path)?;

        // The coordination side file must exist so recovery can delete the
        // whole trio; this engine keeps no state in it.
        adapter
            .open(
                Some(&shm_path_for(path)),
                OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::JOURNAL,
            )?
            .close()?;

        let mut conn = Self {
            adapter: adapter.clone(),
            path: path.to_path_buf(),
            main,
            wal,
            tuning,
            header,
            txn: None,
            row_cache: Vec::new(),
            interrupt: InterruptToken::default(),
        };

        if conn.tuning.exclusive_locking {
            // The ingest connection is the sole writer; holding Exclusive
            // across transactions skips per-commit ladder climbs.
            conn.main.lock(LockLevel::Reserved)?;
            conn.main.lock(LockLevel::Exclusive)?;
        }
        info!(
            path = %path.display(),
            schema = conn.header.is_some(),
            wal_rows = conn.wal.records().len(),
            "opened connection"
        );
        Ok(conn)
    }

    /// Cancellation token for this connection.
    pub fn interrupt_token(&self) -> InterruptToken {
        self.interrupt.clone()
    }

    /// Request abort of in-flight work on this connection.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Create the log table if it does not exist. Idempotent.
    pub fn create_schema(&mut self) -> Result<()> {
        if self.header.is_some() {
            return Ok(());
        }
        let header = StoreHeader::new(self.tuning.page_size);
        self.with_exclusive(|conn| {
            conn.main.write(0, &header.encode())?;
            conn.main.sync(SyncFlags::FULL)?;
            Ok(())
        })?;
        self.header = Some(header);
        debug!(path = %self.path.display(), "created schema");
        Ok(())
    }

    /// Prepare the insert statement. Requires the schema to exist.
    pub fn prepare_insert(&mut self) -> Result<InsertStatement> {
        if self.header.is_none() {
            return Err(SiloError::NotAStore {
                path: self.path.clone(),
            });
        }
        Ok(InsertStatement { _private: () })
    }

    /// Begin a transaction with write intent.
    pub fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(SiloError::NestedTransaction);
        }
        if self.interrupt.take() {
            return Err(SiloError::Interrupted);
        }
        self.verify_header()?;
        if !self.tuning.exclusive_locking {
            self.main.lock(LockLevel::Reserved)?;
        }
        self.txn = Some(Vec::new());
        Ok(())
    }

    /// Insert one row within the open transaction.
    ///
    /// Surfaces `OutOfMemory` when the transaction plus retained cache
    /// exceeds the budget; the caller releases memory and retries once.
    pub fn step(&mut self, _stmt: &InsertStatement, record: &LogRecord) -> Result<()> {
        if self.interrupt.take() {
            return Err(SiloError::Interrupted);
        }
        let txn = self.txn.as_mut().ok_or(SiloError::NoActiveTransaction)?;
        let charged = (txn.len() + self.row_cache.len() + 1) * RECORD_SIZE;
        if charged as u64 > self.tuning.cache_budget {
            return Err(SiloError::OutOfMemory);
        }
        txn.push(record.clone());
        Ok(())
    }

    /// Commit the open transaction as one WAL frame.
    pub fn commit(&mut self) -> Result<()> {
        let rows = self.txn.take().ok_or(SiloError::NoActiveTransaction)?;
        let sync = !matches!(self.tuning.synchronous, SynchronousMode::Off);
        if let Err(e) = self.wal.append_frame(&rows, sync) {
            // The frame may be torn; the next open discards it. The
            // transaction is gone either way.
            self.downgrade_after_txn();
            return Err(e);
        }
        self.row_cache.extend(rows);
        self.downgrade_after_txn();
        Ok(())
    }

    /// Abandon the open transaction.
    pub fn rollback(&mut self) -> Result<()> {
        if self.txn.take().is_none() {
            return Err(SiloError::NoActiveTransaction);
        }
        self.interrupt.take();
        self.downgrade_after_txn();
        Ok(())
    }

    fn downgrade_after_txn(&mut self) {
        if !self.tuning.exclusive_locking && self.main.lock_level() >= LockLevel::Reserved {
            let _ = self.main.unlock(LockLevel::Shared);
        }
    }

    /// Fold WAL frames into the main store. Returns the number of rows
    /// folded. Both modes fold everything this single-writer engine has;
    /// `Truncate` additionally forces the log file itself to media.
    pub fn wal_checkpoint(&mut self, mode: CheckpointMode) -> Result<u64> {
        if self.txn.is_some() {
            return Err(SiloError::internal("checkpoint inside a transaction"));
        }
        let pending = self.wal.records().len();
        if pending == 0 {
            return Ok(0);
        }
        self.verify_header()?;

        let folded = self.with_exclusive(|conn| {
            let mut header = conn
                .header
                .ok_or_else(|| SiloError::corrupt("checkpoint before schema"))?;
            let mut offset = HEADER_SIZE as u64 + header.record_count * RECORD_SIZE as u64;
            let final_size = offset + (pending * RECORD_SIZE) as u64;
            conn.main.file_control(FileControl::SizeHint(final_size))?;

            let mut buf = vec![0u8; FOLD_CHUNK_RECORDS * RECORD_SIZE];
            for chunk in conn.wal.records().chunks(FOLD_CHUNK_RECORDS) {
                for (i, row) in chunk.iter().enumerate() {
                    row.encode_into(&mut buf[i * RECORD_SIZE..]);
                }
                let len = chunk.len() * RECORD_SIZE;
                conn.main.write(offset, &buf[..len])?;
                offset += len as u64;
            }

            header.record_count += pending as u64;
            conn.main.write(0, &header.encode())?;
            // Rows must be durable before the log forgets them.
            conn.main.sync(SyncFlags::FULL)?;
            conn.header = Some(header);
            Ok(pending as u64)
        })?;

        self.wal.reset()?;
        if matches!(mode, CheckpointMode::Truncate) {
            self.adapter.volume().flush()?;
        }
        debug!(path = %self.path.display(), folded, "checkpoint");
        Ok(folded)
    }

    /// Drop the retained row cache. Returns the bytes freed.
    pub fn release_memory(&mut self) -> u64 {
        let freed = (self.row_cache.len() * RECORD_SIZE) as u64;
        self.row_cache.clear();
        self.row_cache.shrink_to_fit();
        freed
    }

    /// Rows visible to this connection: folded store rows then unfolded
    /// WAL rows, in commit order.
    pub fn read_all(&mut self) -> Result<Vec<LogRecord>> {
        self.verify_header()?;
        let count = self.header.map_or(0, |h| h.record_count) as usize;
        let mut out = Vec::with_capacity(count + self.wal.records().len());
        let mut buf = vec![0u8; FOLD_CHUNK_RECORDS * RECORD_SIZE];
        let mut remaining = count;
        let mut offset = HEADER_SIZE as u64;
        while remaining > 0 {
            let n = remaining.min(FOLD_CHUNK_RECORDS);
            let want = n * RECORD_SIZE;
            let got = self.main.read(offset, &mut buf[..want])?;
            if got < want {
                return Err(SiloError::ShortRead {
                    expected: want,
                    actual: got,
                });
            }
            for chunk in buf[..want].chunks_exact(RECORD_SIZE) {
                out.push(LogRecord::decode_from(chunk)?);
            }
            offset += want as u64;
            remaining -= n;
        }
        out.extend_from_slice(self.wal.records());
        Ok(out)
    }

    /// Total committed rows (folded plus unfolded).
    pub fn record_count(&self) -> u64 {
        self.header.map_or(0, |h| h.record_count) + self.wal.records().len() as u64
    }

    /// Current WAL length in bytes.
    pub fn wal_size(&self) -> u64 {
        self.wal.size()
    }

    /// Whether the WAL has outgrown the configured size limit.
    pub fn wants_checkpoint(&self) -> bool {
        self.wal.size() > self.tuning.journal_size_limit
    }

    /// Close the connection, rolling back any open transaction.
    pub fn close(mut self) -> Result<()> {
        if self.txn.take().is_some() {
            warn!(path = %self.path.display(), "closing with an open transaction, rolling back");
        }
        if self.main.lock_level() > LockLevel::None {
            let _ = self.main.unlock(LockLevel::None);
        }
        debug!(path = %self.path.display(), "closed connection");
        // Handles release their registry references on close/drop.
        Ok(())
    }

    fn verify_header(&mut self) -> Result<()> {
        if self.header.is_none() {
            return Ok(());
        }
        let mut buf = [0u8; HEADER_SIZE];
        if self.main.read(0, &mut buf)? < HEADER_SIZE {
            return Err(SiloError::corrupt("store smaller than its header"));
        }
        let header = StoreHeader::decode(&buf)?;
        self.header = Some(header);
        Ok(())
    }

    fn with_exclusive<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let climbed = !self.tuning.exclusive_locking;
        if climbed {
            if self.main.lock_level() < LockLevel::Reserved {
                self.main.lock(LockLevel::Reserved)?;
            }
            self.main.lock(LockLevel::Exclusive)?;
        }
        let out = f(self);
        if climbed {
            let _ = self.main.unlock(LockLevel::Shared);
        }
        out
    }
}
