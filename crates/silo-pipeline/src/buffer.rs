//! Double-buffered capture.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use silo_types::{LogRecord, PipelineStats};
use tracing::trace;

use crate::handoff::{Handoff, ReadyQueue};

/// Which of the two staging buffers this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// A fixed-capacity record buffer. Its lifecycle state is carried by
/// ownership: Filling in the producer, Ready in the ready queue, Free in its
/// handoff slot.
#[derive(Debug)]
pub struct StagingBuffer {
    slot: Slot,
    records: Vec<LogRecord>,
    capacity: usize,
}

impl StagingBuffer {
    pub fn new(slot: Slot, capacity: usize) -> Self {
        Self {
            slot,
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub(crate) fn push(&mut self, record: LogRecord) {
        debug_assert!(!self.is_full());
        self.records.push(record);
    }

    /// Empty the buffer for its next Filling cycle.
    pub fn reset(&mut self) {
        self.records.clear();
    }
}

/// Free-slot handoffs for both buffers, shared by producer and consumer.
#[derive(Debug)]
pub struct FreeSlots {
    a: Handoff<StagingBuffer>,
    b: Handoff<StagingBuffer>,
}

impl FreeSlots {
    fn slot(&self, s: Slot) -> &Handoff<StagingBuffer> {
        match s {
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }

    /// Return a consumed buffer to its own slot.
    pub fn release(&self, mut buf: StagingBuffer) {
        buf.reset();
        self.slot(buf.slot()).send(buf);
    }

    #[cfg(test)]
    pub(crate) fn try_reclaim(&self, s: Slot) -> Option<StagingBuffer> {
        self.slot(s).try_recv()
    }
}

/// The capture-side owner of the active buffer.
///
/// `capture` appends at the fill cursor; when the active buffer is already
/// full the producer publishes it in swap order and blocks, forever if need
/// be, until the other buffer comes back free. The producer can therefore
/// never be more than two buffers of records ahead of the consumer.
pub struct Producer {
    active: StagingBuffer,
    ready: Arc<ReadyQueue<StagingBuffer>>,
    free: Arc<FreeSlots>,
    next_index: u32,
    stats: Arc<PipelineStats>,
}

impl Producer {
    /// Build the producer plus the channel set shared with the consumer.
    /// Buffer A starts Filling; buffer B starts Free in its slot.
    pub fn new(
        capacity: usize,
        stats: Arc<PipelineStats>,
    ) -> (Self, Arc<ReadyQueue<StagingBuffer>>, Arc<FreeSlots>) {
        let ready = Arc::new(ReadyQueue::new());
        let free = Arc::new(FreeSlots {
            a: Handoff::new(),
            b: Handoff::holding(StagingBuffer::new(Slot::B, capacity)),
        });
        let producer = Self {
            active: StagingBuffer::new(Slot::A, capacity),
            ready: Arc::clone(&ready),
            free: Arc::clone(&free),
            next_index: 0,
            stats,
        };
        (producer, ready, free)
    }

    /// Append one record, swapping buffers first if the active one is full.
    ///
    /// The record's capture index and in-buffer sequence number are assigned
    /// here; everything else is the caller's.
    pub fn capture(&mut self, mut record: LogRecord) {
        if self.active.is_full() {
            self.swap();
        }
        record.index = self.next_index;
        record.seq = self.active.len() as u32;
        self.next_index = self.next_index.wrapping_add(1);
        self.active.push(record);
        self.stats.add_captured(1);
    }

    fn swap(&mut self) {
        let outgoing = self.active.slot();
        trace!(slot = ?outgoing, records = self.active.len(), "buffer full, swapping");
        // Publish every record write before the buffer becomes visible to
        // the consumer.
        fence(Ordering::Release);
        let full = std::mem::replace(
            &mut self.active,
            // Placeholder until the free slot yields the real buffer.
            StagingBuffer::new(outgoing.other(), 0),
        );
        self.ready.push(full);
        self.active = self.free.slot(outgoing.other()).recv();
        debug_assert!(self.active.is_empty());
    }

    /// Publish a partially filled buffer without waiting for capacity.
    /// Blocks on the other buffer's free slot like a normal swap.
    pub fn flush(&mut self) {
        if !self.active.is_empty() {
            self.swap();
        }
    }

    /// Publish any partial buffer and close the ready queue so consumers
    /// drain and exit. Consumes the producer.
    pub fn finish(mut self) {
        if !self.active.is_empty() {
            fence(Ordering::Release);
            let other = self.active.slot().other();
            let full = std::mem::replace(&mut self.active, StagingBuffer::new(other, 0));
            self.ready.push(full);
        }
        self.ready.close();
    }

    /// Records captured so far.
    pub fn captured(&self) -> u32 {
        self.next_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::Severity;

    fn rec(msg: &str) -> LogRecord {
        LogRecord::new(0, 1, Severity::Info, "cap", msg).unwrap()
    }

    #[test]
    fn records_keep_capture_order_and_seq() {
        let stats = Arc::new(PipelineStats::new());
        let (mut p, ready, _free) = Producer::new(3, stats);
        for i in 0..3 {
            p.capture(rec(&format!("m{i}")));
        }
        p.finish();
        let buf = ready.pop().unwrap();
        assert_eq!(buf.len(), 3);
        for (i, r) in buf.records().iter().enumerate() {
            assert_eq!(r.index, i as u32);
            assert_eq!(r.seq, i as u32);
            assert_eq!(r.message_str(), format!("m{i}"));
        }
        assert!(ready.pop().is_none());
    }

    #[test]
    fn swap_happens_on_capture_past_capacity() {
        let stats = Arc::new(PipelineStats::new());
        let (mut p, ready, free) = Producer::new(2, stats);
        p.capture(rec("1"));
        p.capture(rec("2"));
        // Still no swap: the buffer seals only when the next record arrives.
        assert!(ready.try_pop().is_none());
        p.capture(rec("3"));
        let first = ready.try_pop().expect("buffer A published");
        assert_eq!(first.slot(), Slot::A);
        assert_eq!(first.len(), 2);
        free.release(first);
        assert_eq!(p.active.slot(), Slot::B);
        assert_eq!(p.active.len(), 1);
    }

    #[test]
    fn flush_publishes_partial_buffer() {
        let stats = Arc::new(PipelineStats::new());
        let (mut p, ready, free) = Producer::new(10, stats);
        p.capture(rec("only"));
        // flush blocks on the free slot, which holds B initially.
        p.flush();
        let buf = ready.try_pop().unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(p.active.slot(), Slot::B);
        free.release(buf);
    }

    #[test]
    fn blocks_at_exactly_two_buffers_without_consumer() {
        use std::sync::mpsc;

        let stats = Arc::new(PipelineStats::new());
        let capacity = 4;
        let (mut p, _ready, _free) = Producer::new(capacity, stats);
        let (tx, rx) = mpsc::channel();
        let t = std::thread::spawn(move || {
            // 2C captures must complete without any consumer.
            for i in 0..2 * capacity {
                p.capture(rec(&format!("{i}")));
                tx.send(i).unwrap();
            }
            // The 2C+1th blocks forever on the free slot.
            p.capture(rec("blocked"));
            tx.send(usize::MAX).unwrap();
        });
        for i in 0..2 * capacity {
            assert_eq!(
                rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap(),
                i
            );
        }
        assert!(
            rx.recv_timeout(std::time::Duration::from_millis(100)).is_err(),
            "producer should be parked on backpressure"
        );
        // Parked thread is left behind deliberately.
        drop(t);
    }
}
