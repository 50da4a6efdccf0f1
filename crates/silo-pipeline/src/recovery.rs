//! Destructive store recovery.
//!
//! Corruption is unrecoverable in place on this appliance; the procedure
//! tears the whole store down and rebuilds it empty. Queue positions are
//! deliberately left alone: the pipeline accepts losing the corrupted
//! transaction rather than stalling ingestion.

use std::path::Path;

use silo_engine::{Connection, InsertStatement, WalFile, shm_path_for};
use silo_error::{Result, SiloError};
use silo_types::EngineTuning;
use silo_vfs::{LockAdapter, Volume};
use tracing::{info, warn};

/// The ingestor's engine session: a connection and its prepared insert,
/// rebuilt as a unit by recovery.
pub struct Session<V: Volume> {
    pub conn: Connection<V>,
    pub stmt: InsertStatement,
}

impl<V: Volume> Session<V> {
    /// Open a connection, apply tuning, ensure the schema, prepare the
    /// insert.
    pub fn open(adapter: &LockAdapter<V>, store: &Path, tuning: &EngineTuning) -> Result<Self> {
        let mut conn = Connection::open(adapter, store, tuning.clone())?;
        conn.create_schema()?;
        let stmt = conn.prepare_insert()?;
        Ok(Self { conn, stmt })
    }

    /// Tear the session down: finalize the statement, then close the
    /// connection, interrupting it first so a busy connection lets go.
    pub fn teardown(self) -> Result<()> {
        self.stmt.finalize();
        self.conn.interrupt();
        self.conn.close()
    }
}

/// Rebuild the store from nothing.
///
/// Steps, in order: tear down the session if one is live, flush the volume,
/// delete the store with its WAL and shared-memory side files, open a fresh
/// connection with the same tuning, recreate the schema, close it again so
/// the next consumption cycle reopens normally.
pub fn recover_store<V: Volume>(
    adapter: &LockAdapter<V>,
    session: Option<Session<V>>,
    store: &Path,
    tuning: &EngineTuning,
) -> Result<()> {
    warn!(store = %store.display(), "store corrupt, rebuilding");

    if let Some(session) = session {
        if let Err(e) = session.teardown() {
            warn!(error = %e, "session teardown failed during recovery, continuing");
        }
    }

    adapter.volume().flush()?;

    let wal = WalFile::<V>::path_for(store);
    let shm = shm_path_for(store);
    for path in [store, wal.as_path(), shm.as_path()] {
        match adapter.delete(path) {
            Ok(()) | Err(SiloError::StoreNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    // Prove the rebuilt store opens and carries the schema, then leave it
    // closed for the next cycle.
    let mut conn = Connection::open(adapter, store, tuning.clone())?;
    conn.create_schema()?;
    conn.close()?;

    info!(store = %store.display(), "store rebuilt");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::{LogRecord, Severity};
    use silo_vfs::MemoryVolume;

    fn rec(i: u32) -> LogRecord {
        LogRecord::new(i, 3, Severity::Error, "rec", "boom").unwrap()
    }

    #[test]
    fn recovery_rebuilds_an_empty_store() {
        let adapter = LockAdapter::new(MemoryVolume::new());
        let store = Path::new("logs.db");
        let tuning = EngineTuning::default();

        let mut session = Session::open(&adapter, store, &tuning).unwrap();
        session.conn.begin().unwrap();
        session.conn.step(&session.stmt, &rec(1)).unwrap();
        session.conn.commit().unwrap();

        recover_store(&adapter, Some(session), store, &tuning).unwrap();

        let mut session = Session::open(&adapter, store, &tuning).unwrap();
        assert_eq!(session.conn.record_count(), 0);
        assert!(session.conn.read_all().unwrap().is_empty());
        session.teardown().unwrap();
    }

    #[test]
    fn recovery_on_clean_store_is_idempotent() {
        let adapter = LockAdapter::new(MemoryVolume::new());
        let store = Path::new("logs.db");
        let tuning = EngineTuning::default();

        recover_store(&adapter, None, store, &tuning).unwrap();
        recover_store(&adapter, None, store, &tuning).unwrap();

        // Schema intact, table empty, store usable.
        let mut session = Session::open(&adapter, store, &tuning).unwrap();
        session.conn.begin().unwrap();
        session.conn.step(&session.stmt, &rec(1)).unwrap();
        session.conn.commit().unwrap();
        assert_eq!(session.conn.record_count(), 1);
        session.teardown().unwrap();
    }
}
