//! Pipeline assembly: wire the capture, staging, and ingestion roles
//! together and own their worker threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use silo_engine::{WalFile, shm_path_for};
use silo_error::{Result, SiloError};
use silo_types::{EngineTuning, IngestStrategy, LogRecord, PipelineConfig, PipelineStats,
    StatsSnapshot};
use silo_vfs::{LockAdapter, Volume};
use tracing::{info, warn};

use crate::buffer::Producer;
use crate::bulk::{BulkCopy, SoftwareCopy};
use crate::handoff::RawBatchQueue;
use crate::ingest::{DirectIngestor, StagedIngestor};
use crate::stager::BatchStager;

/// A running capture pipeline.
///
/// The caller's thread is the capture side; the staging and ingestion roles
/// run on workers spawned at launch. `shutdown` drains everything already
/// captured before returning.
pub struct Pipeline {
    producer: Producer,
    stats: Arc<PipelineStats>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Launch with the plain software copier.
    pub fn launch<V: Volume + Clone>(
        volume: V,
        store: impl Into<PathBuf>,
        config: PipelineConfig,
        tuning: EngineTuning,
    ) -> Result<Self> {
        Self::launch_with_copier(volume, store, config, tuning, SoftwareCopy)
    }

    /// Launch with a caller-supplied bulk copier for the staging role.
    pub fn launch_with_copier<V, C>(
        volume: V,
        store: impl Into<PathBuf>,
        config: PipelineConfig,
        tuning: EngineTuning,
        copier: C,
    ) -> Result<Self>
    where
        V: Volume + Clone,
        C: BulkCopy + 'static,
    {
        let store = store.into();
        let config = config.validated();
        let tuning = tuning.validated();
        if config.fresh_start {
            fresh_start_cleanup(&volume, &store, config.max_queued_files);
        }
        let stats = Arc::new(PipelineStats::new());
        let (producer, ready, free) = Producer::new(config.buffer_capacity, Arc::clone(&stats));

        let mut workers = Vec::new();
        match config.strategy {
            IngestStrategy::Staged => {
                let queue = Arc::new(RawBatchQueue::new(config.max_queued_files));
                let stager = BatchStager::new(
                    Arc::new(volume.clone()),
                    ready,
                    Arc::clone(&free),
                    Arc::clone(&queue),
                    config.clone(),
                    Arc::clone(&stats),
                    copier,
                );
                let ingestor = StagedIngestor::new(
                    LockAdapter::new(volume.clone()),
                    Arc::new(volume),
                    queue,
                    store,
                    config,
                    tuning,
                    Arc::clone(&stats),
                );
                workers.push(spawn_worker("silo-stager", move || stager.run())?);
                workers.push(spawn_worker("silo-ingest", move || ingestor.run())?);
            }
            IngestStrategy::Direct => {
                let ingestor = DirectIngestor::new(
                    LockAdapter::new(volume.clone()),
                    Arc::new(volume),
                    ready,
                    free,
                    store,
                    config,
                    tuning,
                    Arc::clone(&stats),
                );
                workers.push(spawn_worker("silo-ingest", move || ingestor.run())?);
            }
        }

        info!(workers = workers.len(), "pipeline launched");
        Ok(Self {
            producer,
            stats,
            workers,
        })
    }

    /// Capture one record. Blocks only when the producer is a full two
    /// buffers ahead of the consumer.
    pub fn capture(&mut self, record: LogRecord) {
        self.producer.capture(record);
    }

    /// Publish the partially filled active buffer without waiting for it
    /// to fill.
    pub fn flush(&mut self) {
        self.producer.flush();
    }

    /// Records captured so far.
    pub fn captured(&self) -> u32 {
        self.producer.captured()
    }

    /// Live counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop capturing, drain the pipeline, and wait for the workers. The
    /// final counters are the shutdown receipt.
    pub fn shutdown(self) -> StatsSnapshot {
        self.producer.finish();
        for worker in self.workers {
            let name = worker.thread().name().unwrap_or("worker").to_owned();
            if worker.join().is_err() {
                warn!(worker = %name, "worker panicked before shutdown");
            }
        }
        info!("pipeline shut down");
        self.stats.snapshot()
    }
}

/// Start from an empty log: drop the store, its side files, and any batch
/// files a previous run left staged. Missing files are not an error.
fn fresh_start_cleanup<V: Volume>(volume: &V, store: &Path, max_queued: usize) {
    let mut targets = vec![
        store.to_path_buf(),
        WalFile::<V>::path_for(store),
        shm_path_for(store),
    ];
    for i in 0..max_queued {
        targets.push(PathBuf::from(format!("batch_{i}.raw")));
    }
    for path in &targets {
        match volume.delete(path) {
            Ok(()) | Err(SiloError::StoreNotFound { .. }) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "fresh start delete failed"),
        }
    }
}

fn spawn_worker(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    Ok(std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::Severity;
    use silo_vfs::MemoryVolume;
    use std::path::Path;

    fn rec(i: u32) -> LogRecord {
        LogRecord::new(i, 1, Severity::Info, "pipe", "end to end").unwrap()
    }

    fn read_back(volume: &MemoryVolume) -> Vec<LogRecord> {
        let adapter = LockAdapter::new(volume.clone());
        let mut session = crate::recovery::Session::open(
            &adapter,
            Path::new("logs.db"),
            &EngineTuning::default(),
        )
        .unwrap();
        let rows = session.conn.read_all().unwrap();
        session.teardown().unwrap();
        rows
    }

    #[test]
    fn staged_pipeline_round_trips_every_record() {
        let volume = MemoryVolume::new();
        let config = PipelineConfig {
            buffer_capacity: 8,
            chunk_records: 4,
            max_queued_files: 4,
            ..PipelineConfig::default()
        };
        let mut pipeline =
            Pipeline::launch(volume.clone(), "logs.db", config, EngineTuning::default()).unwrap();
        for i in 0..37 {
            pipeline.capture(rec(i));
        }
        let snap = pipeline.shutdown();

        assert_eq!(snap.captured, 37);
        assert_eq!(snap.ingested, 37);
        assert_eq!(snap.skipped, 0);
        let rows = read_back(&volume);
        assert_eq!(rows.len(), 37);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.index, i as u32);
        }
    }

    #[test]
    fn direct_pipeline_round_trips_every_record() {
        let volume = MemoryVolume::new();
        let config = PipelineConfig {
            buffer_capacity: 8,
            strategy: IngestStrategy::Direct,
            ..PipelineConfig::default()
        };
        let mut pipeline =
            Pipeline::launch(volume.clone(), "logs.db", config, EngineTuning::default()).unwrap();
        for i in 0..21 {
            pipeline.capture(rec(i));
        }
        let snap = pipeline.shutdown();

        assert_eq!(snap.ingested, 21);
        assert_eq!(read_back(&volume).len(), 21);
    }

    #[test]
    fn flush_publishes_a_partial_buffer() {
        let volume = MemoryVolume::new();
        let config = PipelineConfig {
            buffer_capacity: 100,
            ..PipelineConfig::default()
        };
        let mut pipeline =
            Pipeline::launch(volume.clone(), "logs.db", config, EngineTuning::default()).unwrap();
        for i in 0..3 {
            pipeline.capture(rec(i));
        }
        pipeline.flush();
        let snap = pipeline.shutdown();
        assert_eq!(snap.ingested, 3);
    }

    #[test]
    fn fresh_start_discards_the_previous_run() {
        let volume = MemoryVolume::new();
        let config = PipelineConfig {
            buffer_capacity: 4,
            ..PipelineConfig::default()
        };

        let mut pipeline = Pipeline::launch(
            volume.clone(),
            "logs.db",
            config.clone(),
            EngineTuning::default(),
        )
        .unwrap();
        for i in 0..6 {
            pipeline.capture(rec(i));
        }
        pipeline.shutdown();
        assert_eq!(read_back(&volume).len(), 6);

        let config = PipelineConfig {
            fresh_start: true,
            ..config
        };
        let mut pipeline =
            Pipeline::launch(volume.clone(), "logs.db", config, EngineTuning::default()).unwrap();
        pipeline.capture(LogRecord::new(0, 7, Severity::Info, "pipe", "after reset").unwrap());
        pipeline.flush();
        let snap = pipeline.shutdown();

        assert_eq!(snap.ingested, 1);
        let rows = read_back(&volume);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token, 7);
        // A relaunched producer numbers captures from zero again.
        assert_eq!(rows[0].index, 0);
    }
}
