//! The ingestion role: fold captured records into the store.
//!
//! Two strategies share the engine session plumbing. The staged ingestor
//! consumes raw batch files from the queue, one chunked transaction at a
//! time, and tolerates per-row failures. The direct ingestor takes whole
//! buffers off the ready queue and commits each as a single transaction,
//! abandoning the entire buffer if any row refuses.
//!
//! A corrupt store is handled the same way in both: the session is torn
//! down, the store trio deleted and rebuilt empty, and ingestion carries on
//! with whatever comes next. Queue indices are never rewound.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use silo_error::{Result, SiloError};
use silo_types::record::RECORD_SIZE;
use silo_types::{CheckpointMode, EngineTuning, LogRecord, PipelineConfig, PipelineStats};
use silo_vfs::{LockAdapter, Volume, VolumeFile};
use tracing::{debug, info, warn};

use crate::buffer::{FreeSlots, StagingBuffer};
use crate::handoff::{RawBatchQueue, ReadyQueue};
use crate::recovery::{Session, recover_store};

// ---------------------------------------------------------------------------
// Shared session plumbing
// ---------------------------------------------------------------------------

struct SessionKeeper<V: Volume> {
    adapter: LockAdapter<V>,
    store: PathBuf,
    tuning: EngineTuning,
    session: Option<Session<V>>,
    chunks_since_checkpoint: u64,
}

impl<V: Volume> SessionKeeper<V> {
    fn new(adapter: LockAdapter<V>, store: PathBuf, tuning: EngineTuning) -> Self {
        Self {
            adapter,
            store,
            tuning,
            session: None,
            chunks_since_checkpoint: 0,
        }
    }

    /// Open the session if it is not already live.
    fn ensure_open(&mut self) -> Result<&mut Session<V>> {
        if self.session.is_none() {
            self.session = Some(Session::open(&self.adapter, &self.store, &self.tuning)?);
        }
        Ok(self.session.as_mut().unwrap())
    }

    /// Tear down and rebuild the store after a corruption report. Returns
    /// whether the rebuild went through; callers back off before retrying
    /// a failed one.
    fn recover(&mut self, stats: &PipelineStats, cause: &SiloError) -> bool {
        warn!(error = %cause, "ingestion hit corruption, recovering store");
        let session = self.session.take();
        let rebuilt = match recover_store(&self.adapter, session, &self.store, &self.tuning) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store recovery failed, will retry on next cycle");
                false
            }
        };
        stats.recovery();
        rebuilt
    }

    /// Fold one committed transaction's worth of bookkeeping: trim the row
    /// cache and checkpoint when due.
    fn after_commit(&mut self, checkpoint_every: u64) -> Result<()> {
        let session = self.session.as_mut().unwrap();
        session.conn.release_memory();
        self.chunks_since_checkpoint += 1;
        if self.chunks_since_checkpoint >= checkpoint_every || session.conn.wants_checkpoint() {
            let folded = session.conn.wal_checkpoint(CheckpointMode::Passive)?;
            debug!(folded, "passive checkpoint");
            self.chunks_since_checkpoint = 0;
        }
        Ok(())
    }

    /// Final checkpoint and close. Called once at shutdown.
    fn finish(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.conn.wal_checkpoint(CheckpointMode::Truncate) {
                warn!(error = %e, "final checkpoint failed");
            }
            if let Err(e) = session.teardown() {
                warn!(error = %e, "session close failed at shutdown");
            }
        }
    }
}

/// Insert one record, retrying once through the cache-release valve when the
/// row cache is over budget.
fn step_with_retry<V: Volume>(session: &mut Session<V>, record: &LogRecord) -> Result<()> {
    match session.conn.step(&session.stmt, record) {
        Err(SiloError::OutOfMemory) => {
            let freed = session.conn.release_memory();
            debug!(freed, "row cache over budget, released and retrying");
            session.conn.step(&session.stmt, record)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Staged ingestion
// ---------------------------------------------------------------------------

/// Consumes raw batch files in queue order and folds them into the store.
pub struct StagedIngestor<V: Volume> {
    volume: Arc<V>,
    queue: Arc<RawBatchQueue>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    keeper: SessionKeeper<V>,
}

impl<V: Volume> StagedIngestor<V> {
    pub fn new(
        adapter: LockAdapter<V>,
        volume: Arc<V>,
        queue: Arc<RawBatchQueue>,
        store: PathBuf,
        config: PipelineConfig,
        tuning: EngineTuning,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            volume,
            queue,
            config,
            stats,
            keeper: SessionKeeper::new(adapter, store, tuning),
        }
    }

    /// Wait for staged files until the signal closes and drains, consuming
    /// each in turn. Finishes with a truncating checkpoint.
    pub fn run(mut self) {
        while self.queue.files_ready.wait() {
            match self.keeper.ensure_open() {
                Ok(_) => {}
                Err(e) if e.is_corruption() => {
                    // The store was already bad at open time. Rebuild it and
                    // put the count back so this file is retried.
                    if !self.keeper.recover(&self.stats, &e) {
                        std::thread::sleep(self.config.reopen_backoff);
                    }
                    self.queue.files_ready.raise();
                    continue;
                }
                Err(e) => {
                    // The store is unreachable right now. Put the count back
                    // so the file is retried after a pause instead of leaking.
                    warn!(error = %e, "cannot open store, backing off");
                    std::thread::sleep(self.config.reopen_backoff);
                    self.queue.files_ready.raise();
                    continue;
                }
            }

            let name = self.queue.consume_file_name();
            match self.consume_file(&name) {
                Ok((ingested, skipped)) => {
                    self.stats.add_ingested(ingested);
                    self.stats.add_skipped(skipped);
                    debug!(file = %name, ingested, skipped, "consumed batch file");
                }
                Err(e) if e.is_corruption() => {
                    self.keeper.recover(&self.stats, &e);
                    // The file's unfolded rows went down with the store.
                    self.stats.add_skipped(self.count_records(&name));
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "batch file dropped");
                    self.stats.add_skipped(self.count_records(&name));
                }
            }

            match self.volume.delete(Path::new(&name)) {
                Ok(()) | Err(SiloError::StoreNotFound { .. }) => {}
                Err(e) => warn!(file = %name, error = %e, "could not remove consumed file"),
            }
            self.queue.advance_consume();
            self.stats.file_consumed();
            if self.queue.occupancy() < self.queue.max_queued() {
                self.queue.producer_gate.open_gate();
            }
        }
        self.keeper.finish();
        info!("staged ingestor finished");
    }

    /// Ingest one staged file in chunk-sized transactions.
    ///
    /// Returns `(ingested, skipped)` row counts. Corruption aborts the file
    /// and propagates; any other per-row failure skips just that row.
    fn consume_file(&mut self, name: &str) -> Result<(u64, u64)> {
        let mut file = self.volume.open(Path::new(name), false)?;
        let size = file.size()?;

        let whole = size / RECORD_SIZE as u64 * RECORD_SIZE as u64;
        if whole != size {
            warn!(
                file = %name,
                trailing = size - whole,
                "ignoring trailing partial record"
            );
        }

        let mut ingested = 0u64;
        let mut skipped = 0u64;
        // Files can be many megabytes; read them through a chunk-sized
        // landing buffer instead of one allocation the size of the file.
        let chunk_bytes = self.config.chunk_records * RECORD_SIZE;
        let mut landing = vec![0u8; chunk_bytes];
        let mut offset = 0u64;
        while offset < whole {
            let want = ((whole - offset) as usize).min(chunk_bytes);
            let got = file.read(&mut landing[..want])?;
            if got < want {
                return Err(SiloError::ShortRead {
                    expected: want,
                    actual: got,
                });
            }
            offset += want as u64;

            let session = self.keeper.session.as_mut().unwrap();
            session.conn.begin()?;
            for raw in landing[..want].chunks_exact(RECORD_SIZE) {
                let record = LogRecord::decode_from(raw)?;
                match step_with_retry(self.keeper.session.as_mut().unwrap(), &record) {
                    Ok(()) => ingested += 1,
                    Err(e) if e.is_corruption() => {
                        let _ = self.keeper.session.as_mut().unwrap().conn.rollback();
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(error = %e, index = record.index, "row refused, skipping");
                        skipped += 1;
                    }
                }
            }
            self.keeper.session.as_mut().unwrap().conn.commit()?;
            self.keeper.after_commit(self.config.checkpoint_every)?;
        }
        Ok((ingested, skipped))
    }

    fn count_records(&self, name: &str) -> u64 {
        self.volume
            .attributes(Path::new(name))
            .map(|a| a.size / RECORD_SIZE as u64)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Direct ingestion
// ---------------------------------------------------------------------------

/// Folds ready buffers straight into the store, bypassing the staging files.
pub struct DirectIngestor<V: Volume> {
    volume: Arc<V>,
    ready: Arc<ReadyQueue<StagingBuffer>>,
    free: Arc<FreeSlots>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    keeper: SessionKeeper<V>,
}

impl<V: Volume> DirectIngestor<V> {
    pub fn new(
        adapter: LockAdapter<V>,
        volume: Arc<V>,
        ready: Arc<ReadyQueue<StagingBuffer>>,
        free: Arc<FreeSlots>,
        store: PathBuf,
        config: PipelineConfig,
        tuning: EngineTuning,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            volume,
            ready,
            free,
            config,
            stats,
            keeper: SessionKeeper::new(adapter, store, tuning),
        }
    }

    /// Consume ready buffers until the producer closes the queue.
    pub fn run(mut self) {
        while let Some(buf) = self.ready.pop() {
            // Stale read caches on the volume would let the engine see old
            // store pages after another writer; drop them first.
            self.volume.invalidate_cache();

            loop {
                match self.keeper.ensure_open() {
                    Ok(_) => break,
                    Err(e) if e.is_corruption() => {
                        if !self.keeper.recover(&self.stats, &e) {
                            std::thread::sleep(self.config.reopen_backoff);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot open store, backing off");
                        std::thread::sleep(self.config.reopen_backoff);
                    }
                }
            }

            match self.consume_buffer(&buf) {
                Ok(n) => {
                    self.stats.add_ingested(n);
                    debug!(records = n, "ingested buffer");
                }
                Err(e) if e.is_corruption() => {
                    self.keeper.recover(&self.stats, &e);
                    self.stats.add_skipped(buf.len() as u64);
                }
                Err(e) => {
                    warn!(error = %e, lost = buf.len(), "buffer abandoned");
                    self.stats.add_skipped(buf.len() as u64);
                }
            }
            self.free.release(buf);
        }
        self.keeper.finish();
        info!("direct ingestor finished");
    }

    /// One buffer, one transaction. Any row failure rolls the whole buffer
    /// back so the store never holds a partial capture group.
    fn consume_buffer(&mut self, buf: &StagingBuffer) -> Result<u64> {
        let session = self.keeper.session.as_mut().unwrap();
        session.conn.begin()?;
        for record in buf.records() {
            if let Err(e) = step_with_retry(self.keeper.session.as_mut().unwrap(), record) {
                let _ = self.keeper.session.as_mut().unwrap().conn.rollback();
                return Err(e);
            }
        }
        self.keeper.session.as_mut().unwrap().conn.commit()?;
        self.keeper.after_commit(self.config.checkpoint_every)?;
        Ok(buf.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Producer, Slot};
    use silo_types::Severity;
    use silo_vfs::MemoryVolume;

    fn rec(i: u32, msg: &str) -> LogRecord {
        LogRecord::new(i, 7, Severity::Info, "ingest", msg).unwrap()
    }

    fn write_batch<V: Volume>(volume: &V, name: &str, records: &[LogRecord]) {
        let path = Path::new(name);
        volume.create(path).unwrap();
        let mut file = volume.open(path, true).unwrap();
        for r in records {
            file.write(&r.encode()).unwrap();
        }
        file.flush().unwrap();
    }

    fn read_store(adapter: &LockAdapter<MemoryVolume>, store: &Path) -> Vec<LogRecord> {
        let mut session = Session::open(adapter, store, &EngineTuning::default()).unwrap();
        let rows = session.conn.read_all().unwrap();
        session.teardown().unwrap();
        rows
    }

    /// A volume whose deletes can be made to fail, as worn flash does.
    #[derive(Debug, Clone)]
    struct BrittleVolume {
        inner: MemoryVolume,
        fail_deletes: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Volume for BrittleVolume {
        type File = <MemoryVolume as Volume>::File;

        fn name(&self) -> &str {
            "brittle"
        }

        fn create(&self, path: &Path) -> Result<()> {
            self.inner.create(path)
        }

        fn open(&self, path: &Path, writable: bool) -> Result<Self::File> {
            self.inner.open(path, writable)
        }

        fn delete(&self, path: &Path) -> Result<()> {
            if self.fail_deletes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SiloError::volume_io("delete", "media refused the erase"));
            }
            self.inner.delete(path)
        }

        fn attributes(&self, path: &Path) -> Result<silo_vfs::FileAttributes> {
            self.inner.attributes(path)
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }
    }

    fn staged_ingestor(
        volume: &MemoryVolume,
        queue: Arc<RawBatchQueue>,
        config: PipelineConfig,
    ) -> StagedIngestor<MemoryVolume> {
        StagedIngestor::new(
            LockAdapter::new(volume.clone()),
            Arc::new(volume.clone()),
            queue,
            PathBuf::from("logs.db"),
            config.validated(),
            EngineTuning::default(),
            Arc::new(PipelineStats::new()),
        )
    }

    #[test]
    fn staged_ingest_folds_files_in_queue_order() {
        let volume = MemoryVolume::new();
        let queue = Arc::new(RawBatchQueue::new(8));

        let first: Vec<_> = (0..5).map(|i| rec(i, "first")).collect();
        let second: Vec<_> = (5..8).map(|i| rec(i, "second")).collect();
        write_batch(&volume, &queue.produce_file_name(), &first);
        queue.advance_produce();
        write_batch(&volume, &queue.produce_file_name(), &second);
        queue.advance_produce();
        queue.files_ready.close();

        let ingestor = staged_ingestor(&volume, Arc::clone(&queue), PipelineConfig::default());
        let stats = Arc::clone(&ingestor.stats);
        ingestor.run();

        let adapter = LockAdapter::new(volume.clone());
        let rows = read_store(&adapter, Path::new("logs.db"));
        assert_eq!(rows.len(), 8);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.index, i as u32);
        }
        assert_eq!(rows[0].message_str(), "first");
        assert_eq!(rows[7].message_str(), "second");

        let snap = stats.snapshot();
        assert_eq!(snap.ingested, 8);
        assert_eq!(snap.files_consumed, 2);
        assert_eq!(queue.consume_idx(), 2);
        // Consumed files are gone from the staging area.
        assert!(volume.attributes(Path::new("batch_0.raw")).is_err());
        assert!(volume.attributes(Path::new("batch_1.raw")).is_err());
    }

    #[test]
    fn staged_ingest_ignores_trailing_partial_record() {
        let volume = MemoryVolume::new();
        let queue = Arc::new(RawBatchQueue::new(4));

        let name = queue.produce_file_name();
        write_batch(&volume, &name, &[rec(0, "whole"), rec(1, "whole")]);
        {
            let mut file = volume.open(Path::new(&name), true).unwrap();
            file.seek(2 * RECORD_SIZE as u64).unwrap();
            file.write(&[0xEE; 100]).unwrap();
        }
        queue.advance_produce();
        queue.files_ready.close();

        let ingestor = staged_ingestor(&volume, Arc::clone(&queue), PipelineConfig::default());
        let stats = Arc::clone(&ingestor.stats);
        ingestor.run();

        let adapter = LockAdapter::new(volume.clone());
        assert_eq!(read_store(&adapter, Path::new("logs.db")).len(), 2);
        assert_eq!(stats.snapshot().ingested, 2);
        assert_eq!(stats.snapshot().skipped, 0);
    }

    #[test]
    fn corrupt_store_is_rebuilt_and_later_files_still_land() {
        let volume = MemoryVolume::new();
        let queue = Arc::new(RawBatchQueue::new(8));
        let store = Path::new("logs.db");

        // Seed a store, then damage its header at the media level.
        {
            let adapter = LockAdapter::new(volume.clone());
            let mut session = Session::open(&adapter, store, &EngineTuning::default()).unwrap();
            session.teardown().unwrap();
        }
        {
            let mut file = volume.open(store, true).unwrap();
            file.write(b"not a store header at all").unwrap();
            file.flush().unwrap();
        }

        write_batch(&volume, &queue.produce_file_name(), &[rec(0, "first")]);
        queue.advance_produce();
        write_batch(&volume, &queue.produce_file_name(), &[rec(1, "second")]);
        queue.advance_produce();
        queue.files_ready.close();

        let ingestor = staged_ingestor(&volume, Arc::clone(&queue), PipelineConfig::default());
        let stats = Arc::clone(&ingestor.stats);
        ingestor.run();

        // The open failure rebuilds the store and retries, so no file is
        // lost; both land in the fresh store in order.
        let adapter = LockAdapter::new(volume.clone());
        let rows = read_store(&adapter, store);
        assert_eq!(stats.snapshot().recoveries, 1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message_str(), "first");
        assert_eq!(rows[1].message_str(), "second");
        assert_eq!(queue.consume_idx(), 2);
    }

    #[test]
    fn failed_recovery_backs_off_instead_of_spinning() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let fail = Arc::new(AtomicBool::new(true));
        let volume = BrittleVolume {
            inner: MemoryVolume::new(),
            fail_deletes: Arc::clone(&fail),
        };
        let queue = Arc::new(RawBatchQueue::new(4));
        let store = Path::new("logs.db");

        // A corrupt store that recovery cannot erase while the media
        // refuses deletes.
        volume.create(store).unwrap();
        {
            let mut file = volume.open(store, true).unwrap();
            file.write(&[0xFF; 64]).unwrap();
            file.flush().unwrap();
        }

        let batch: Vec<_> = (0..3).map(|i| rec(i, "kept")).collect();
        write_batch(&volume, &queue.produce_file_name(), &batch);
        queue.advance_produce();
        queue.files_ready.close();

        let config = PipelineConfig {
            reopen_backoff: Duration::from_millis(10),
            ..PipelineConfig::default()
        };
        let ingestor = StagedIngestor::new(
            LockAdapter::new(volume.clone()),
            Arc::new(volume.clone()),
            Arc::clone(&queue),
            PathBuf::from("logs.db"),
            config.validated(),
            EngineTuning::default(),
            Arc::new(PipelineStats::new()),
        );
        let stats = Arc::clone(&ingestor.stats);
        let worker = std::thread::spawn(move || ingestor.run());

        // Let the rebuild fail a few times, then heal the media.
        std::thread::sleep(Duration::from_millis(60));
        fail.store(false, Ordering::SeqCst);
        worker.join().unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.ingested, 3);
        assert!(snap.recoveries >= 1);
        // Each failed rebuild waits out the backoff; an unthrottled retry
        // loop would rack up thousands of attempts in this window.
        assert!(
            snap.recoveries < 50,
            "{} recovery attempts in ~60ms",
            snap.recoveries
        );
    }

    #[test]
    fn corruption_under_a_live_session_recovers_and_next_file_lands() {
        let volume = MemoryVolume::new();
        let queue = Arc::new(RawBatchQueue::new(8));
        let store = Path::new("logs.db");

        write_batch(&volume, &queue.produce_file_name(), &[rec(0, "lost")]);
        queue.advance_produce();
        write_batch(&volume, &queue.produce_file_name(), &[rec(1, "kept")]);
        queue.advance_produce();
        queue.files_ready.close();

        let mut ingestor =
            staged_ingestor(&volume, Arc::clone(&queue), PipelineConfig::default());
        let stats = Arc::clone(&ingestor.stats);
        // Open the session, then damage the store at the media level so the
        // next transaction's header check trips mid-stream.
        ingestor.keeper.ensure_open().unwrap();
        {
            let mut file = volume.open(store, true).unwrap();
            file.write(&[0xFF; 64]).unwrap();
            file.flush().unwrap();
        }
        ingestor.run();

        let snap = stats.snapshot();
        assert_eq!(snap.recoveries, 1);
        assert_eq!(snap.skipped, 1);
        let rows = read_store(&LockAdapter::new(volume.clone()), store);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_str(), "kept");
        // Both files were consumed and removed either way.
        assert_eq!(queue.consume_idx(), 2);
        assert!(volume.attributes(Path::new("batch_0.raw")).is_err());
        assert!(volume.attributes(Path::new("batch_1.raw")).is_err());
    }

    #[test]
    fn consume_reopens_gate_when_queue_drains() {
        let volume = MemoryVolume::new();
        let queue = Arc::new(RawBatchQueue::new(2));

        write_batch(&volume, &queue.produce_file_name(), &[rec(0, "a")]);
        queue.advance_produce();
        write_batch(&volume, &queue.produce_file_name(), &[rec(1, "b")]);
        queue.advance_produce();
        queue.producer_gate.close_gate();
        queue.files_ready.close();

        let ingestor = staged_ingestor(&volume, Arc::clone(&queue), PipelineConfig::default());
        ingestor.run();

        assert!(queue.producer_gate.is_open());
        assert_eq!(queue.occupancy(), 0);
    }

    #[test]
    fn direct_ingest_commits_each_buffer_whole() {
        let volume = MemoryVolume::new();
        let stats = Arc::new(PipelineStats::new());
        let (mut producer, ready, free) = Producer::new(8, Arc::clone(&stats));
        for i in 0..6 {
            producer.capture(rec(i, "direct"));
        }
        producer.finish();

        let ingestor = DirectIngestor::new(
            LockAdapter::new(volume.clone()),
            Arc::new(volume.clone()),
            Arc::clone(&ready),
            Arc::clone(&free),
            PathBuf::from("logs.db"),
            PipelineConfig {
                strategy: silo_types::IngestStrategy::Direct,
                ..PipelineConfig::default()
            }
            .validated(),
            EngineTuning::default(),
            Arc::clone(&stats),
        );
        ingestor.run();

        let adapter = LockAdapter::new(volume.clone());
        let rows = read_store(&adapter, Path::new("logs.db"));
        assert_eq!(rows.len(), 6);
        assert_eq!(stats.snapshot().ingested, 6);
        // The drained buffer went back to its free slot, reset.
        let returned = free.try_reclaim(Slot::A).unwrap();
        assert!(returned.is_empty());
    }

    #[test]
    fn checkpoint_every_chunk_bound_truncates_wal_at_shutdown() {
        let volume = MemoryVolume::new();
        let queue = Arc::new(RawBatchQueue::new(4));
        let config = PipelineConfig {
            chunk_records: 4,
            checkpoint_every: 2,
            ..PipelineConfig::default()
        };

        let records: Vec<_> = (0..20).map(|i| rec(i, "chunky")).collect();
        write_batch(&volume, &queue.produce_file_name(), &records);
        queue.advance_produce();
        queue.files_ready.close();

        let ingestor = staged_ingestor(&volume, Arc::clone(&queue), config);
        ingestor.run();

        // Shutdown runs a truncating checkpoint, so the WAL holds nothing.
        let adapter = LockAdapter::new(volume.clone());
        let mut session = Session::open(&adapter, Path::new("logs.db"), &EngineTuning::default())
            .unwrap();
        assert_eq!(session.conn.record_count(), 20);
        assert_eq!(session.conn.wal_size(), 0);
        session.teardown().unwrap();
    }
}
