//! The staging role: drain ready buffers into raw batch files.
//!
//! Staged files are headerless concatenations of encoded records, written to
//! the volume directly (they are single-owner scratch data; only the store
//! files go through the lock adapter). The drain is chunked: encode a chunk,
//! bulk-copy it into the landing buffer, write the landing buffer, repeat.
//! The source buffer goes back to its free slot only after the whole drain,
//! which is what holds the producer to the two-buffer bound.

use std::path::Path;
use std::sync::Arc;

use silo_error::{Result, SiloError};
use silo_types::record::RECORD_SIZE;
use silo_types::{PipelineConfig, PipelineStats};
use silo_vfs::{Volume, VolumeFile};
use tracing::{debug, info, warn};

use crate::buffer::{FreeSlots, StagingBuffer};
use crate::bulk::{BulkCopy, copy_with_fallback};
use crate::handoff::{RawBatchQueue, ReadyQueue};

/// Drains ready buffers to `batch_{produce_index % max}.raw` files.
pub struct BatchStager<V: Volume, C: BulkCopy> {
    volume: Arc<V>,
    ready: Arc<ReadyQueue<StagingBuffer>>,
    free: Arc<FreeSlots>,
    queue: Arc<RawBatchQueue>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    copier: C,
    encode_buf: Vec<u8>,
    landing_buf: Vec<u8>,
}

impl<V: Volume, C: BulkCopy> BatchStager<V, C> {
    pub fn new(
        volume: Arc<V>,
        ready: Arc<ReadyQueue<StagingBuffer>>,
        free: Arc<FreeSlots>,
        queue: Arc<RawBatchQueue>,
        config: PipelineConfig,
        stats: Arc<PipelineStats>,
        copier: C,
    ) -> Self {
        let chunk_bytes = config.chunk_records * RECORD_SIZE;
        Self {
            volume,
            ready,
            free,
            queue,
            config,
            stats,
            copier,
            encode_buf: vec![0u8; chunk_bytes],
            landing_buf: vec![0u8; chunk_bytes],
        }
    }

    /// Consume ready buffers until the queue closes, then signal the
    /// ingestor that no more files are coming.
    pub fn run(mut self) {
        while let Some(buf) = self.ready.pop() {
            // Occupancy at the bound means the next file name is still in
            // use; park here until the ingestor frees capacity.
            if self.queue.occupancy() >= self.queue.max_queued() {
                self.stats.producer_suspended();
                info!("staged-file queue full, producer side suspended");
                self.queue.wait_for_capacity();
            }

            let name = self.queue.produce_file_name();
            match self.write_batch_file(&name, &buf) {
                Ok(records) => {
                    self.stats.add_staged(records as u64);
                    self.free.release(buf);
                    self.queue.advance_produce();
                    debug!(file = %name, records, "staged buffer");
                }
                Err(e) => {
                    // The buffer's records are lost; staging media failed.
                    warn!(file = %name, error = %e, lost = buf.len(), "failed to stage buffer");
                    self.stats.add_skipped(buf.len() as u64);
                    self.free.release(buf);
                }
            }
        }
        self.queue.files_ready.close();
        debug!("stager finished");
    }

    fn write_batch_file(&mut self, name: &str, buf: &StagingBuffer) -> Result<usize> {
        let path = Path::new(name);
        // A failed previous cycle may have left a stale file under this name.
        match self.volume.delete(path) {
            Ok(()) | Err(SiloError::StoreNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.volume.create(path)?;
        let mut file = self.volume.open(path, true)?;

        let mut written = 0usize;
        for chunk in buf.records().chunks(self.config.chunk_records) {
            let len = chunk.len() * RECORD_SIZE;
            for (i, rec) in chunk.iter().enumerate() {
                rec.encode_into(&mut self.encode_buf[i * RECORD_SIZE..]);
            }
            copy_with_fallback(
                &mut self.copier,
                &self.encode_buf[..len],
                &mut self.landing_buf[..len],
                self.config.bulk_copy_timeout,
            );
            file.write(&self.landing_buf[..len])?;
            written += chunk.len();
        }
        file.flush()?;
        self.volume.flush()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Producer;
    use crate::bulk::SoftwareCopy;
    use crate::bulk::test_support::FlakyCopy;
    use silo_types::{LogRecord, Severity};
    use silo_vfs::MemoryVolume;

    fn rec(msg: &str) -> LogRecord {
        LogRecord::new(0, 2, Severity::Info, "stage", msg).unwrap()
    }

    fn run_stager<C: BulkCopy + 'static>(capacity: usize, records: usize, copier: C) -> (MemoryVolume, Arc<RawBatchQueue>, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let (mut producer, ready, free) = Producer::new(capacity, Arc::clone(&stats));
        let volume = MemoryVolume::new();
        let queue = Arc::new(RawBatchQueue::new(4));
        let config = PipelineConfig {
            buffer_capacity: capacity,
            chunk_records: 2,
            ..PipelineConfig::default()
        }
        .validated();
        let stager = BatchStager::new(
            Arc::new(volume.clone()),
            ready,
            Arc::clone(&free),
            Arc::clone(&queue),
            config,
            Arc::clone(&stats),
            copier,
        );
        let t = std::thread::spawn(move || stager.run());
        for i in 0..records {
            producer.capture(rec(&format!("m{i}")));
        }
        producer.finish();
        t.join().unwrap();
        (volume, queue, stats)
    }

    #[test]
    fn capacity_four_nine_records_yields_two_files_of_four() {
        let (volume, queue, stats) = run_stager(4, 9, SoftwareCopy);
        // Swaps on records 5 and 9: two full files staged, one record still
        // in flight published by finish().
        assert_eq!(queue.produce_idx(), 3);
        let f0 = volume.attributes(Path::new("batch_0.raw")).unwrap();
        let f1 = volume.attributes(Path::new("batch_1.raw")).unwrap();
        let f2 = volume.attributes(Path::new("batch_2.raw")).unwrap();
        assert_eq!(f0.size, 4 * RECORD_SIZE as u64);
        assert_eq!(f1.size, 4 * RECORD_SIZE as u64);
        assert_eq!(f2.size, RECORD_SIZE as u64);
        assert_eq!(stats.snapshot().staged, 9);
    }

    #[test]
    fn staged_bytes_decode_in_capture_order() {
        let (volume, _queue, _stats) = run_stager(3, 3, SoftwareCopy);
        let mut f = volume.open(Path::new("batch_0.raw"), false).unwrap();
        let mut bytes = vec![0u8; 3 * RECORD_SIZE];
        assert_eq!(f.read(&mut bytes).unwrap(), 3 * RECORD_SIZE);
        for i in 0..3 {
            let r = LogRecord::decode_from(&bytes[i * RECORD_SIZE..]).unwrap();
            assert_eq!(r.index, i as u32);
            assert_eq!(r.message_str(), format!("m{i}"));
        }
    }

    #[test]
    fn flaky_copier_still_stages_exact_bytes() {
        let (volume, _queue, _stats) = run_stager(
            4,
            4,
            FlakyCopy {
                failures: 1,
                calls: 0,
            },
        );
        let mut f = volume.open(Path::new("batch_0.raw"), false).unwrap();
        let mut bytes = vec![0u8; 4 * RECORD_SIZE];
        assert_eq!(f.read(&mut bytes).unwrap(), 4 * RECORD_SIZE);
        // First chunk went through the fallback path; content must match.
        let r = LogRecord::decode_from(&bytes).unwrap();
        assert_eq!(r.message_str(), "m0");
        let r = LogRecord::decode_from(&bytes[3 * RECORD_SIZE..]).unwrap();
        assert_eq!(r.message_str(), "m3");
    }

    #[test]
    fn full_queue_suspends_stager_until_consumer_frees_capacity() {
        use std::time::Duration;

        let stats = Arc::new(PipelineStats::new());
        let (mut producer, ready, free) = Producer::new(2, Arc::clone(&stats));
        let volume = MemoryVolume::new();
        let queue = Arc::new(RawBatchQueue::new(2));
        // Pretend two files are already staged and unconsumed.
        queue.advance_produce();
        queue.advance_produce();
        assert_eq!(queue.occupancy(), 2);

        let stager = BatchStager::new(
            Arc::new(volume.clone()),
            Arc::clone(&ready),
            free,
            Arc::clone(&queue),
            PipelineConfig::default().validated(),
            Arc::clone(&stats),
            SoftwareCopy,
        );
        let t = std::thread::spawn(move || stager.run());

        producer.capture(rec("queued"));
        producer.finish();

        // The stager popped the buffer but must park on the gate it closed.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while queue.producer_gate.is_open() {
            assert!(std::time::Instant::now() < deadline, "stager never parked");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.snapshot().producer_suspensions, 1);
        assert_eq!(stats.snapshot().staged, 0);

        // Consuming one file reopens the gate; the stager resumes and stages.
        queue.advance_consume();
        queue.producer_gate.open_gate();
        t.join().unwrap();
        assert_eq!(stats.snapshot().staged, 1);
    }

    #[test]
    fn files_ready_signal_counts_staged_files() {
        let (_volume, queue, _stats) = run_stager(2, 6, SoftwareCopy);
        assert!(queue.files_ready.wait());
        assert!(queue.files_ready.wait());
        assert!(queue.files_ready.wait());
        assert!(!queue.files_ready.wait());
    }
}
