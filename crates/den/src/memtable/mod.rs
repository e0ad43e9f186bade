//! Timestamp-ordered write buffer and its background flusher.
//!
//! Records are buffered in a min-heap keyed by `(timestamp, seq)`. When the
//! active buffer fills up, is flushed explicitly, or stays idle for the
//! configured interval, it is frozen and handed to a single flusher thread
//! that drains it in ascending timestamp order into a [`FlushSink`].
//!
//! ```text
//! add() ──► active heap ──rotate──► flush queue ──► flusher thread ──► FlushSink
//!           (active lock)           (queue lock)     (one chunk at a time)
//! ```
//!
//! Lock order is always active buffer first, then queue.

pub mod watermark;

pub use watermark::FlushWatermark;

use crate::config::MemTableConfig;
use crate::error::{DenError, Result};
use crate::format::LogRecord;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A record tagged with the sequence number it was accepted under.
#[derive(Debug, Clone)]
pub struct BufferedRecord {
    /// Engine-assigned sequence number.
    pub seq: u64,
    /// The buffered record.
    pub record: LogRecord,
}

impl BufferedRecord {
    fn sort_key(&self) -> (i64, u64) {
        (self.record.timestamp, self.seq)
    }
}

impl PartialEq for BufferedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for BufferedRecord {}

impl PartialOrd for BufferedRecord {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for BufferedRecord {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Outcome of draining one chunk into a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Records persisted.
    pub written: usize,
    /// Records rejected individually (for example past writes).
    pub rejected: usize,
}

/// Destination of memtable chunks.
pub trait FlushSink: Send + Sync {
    /// Drains `chunk` by popping records in order.
    ///
    /// Records rejected one by one are counted in the outcome. An error aborts
    /// the chunk; whatever is left in it is considered lost.
    fn flush_chunk(&self, chunk: &mut FrozenBuffer) -> Result<FlushOutcome>;

    /// Called after each chunk with the highest sequence known to be persisted.
    fn checkpoint(&self, _safe_seq: u64) {}
}

/// A rotated, read-only buffer waiting in the flush queue.
#[derive(Debug)]
pub struct FrozenBuffer {
    id: u64,
    heap: BinaryHeap<Reverse<BufferedRecord>>,
    bytes: usize,
    min_seq: u64,
    max_seq: u64,
}

impl FrozenBuffer {
    /// Chunk id, increasing per rotation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Records still held.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether every record has been popped.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Encoded bytes at rotation time.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Lowest sequence number in the chunk.
    pub fn min_seq(&self) -> u64 {
        self.min_seq
    }

    /// Highest sequence number in the chunk.
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    /// Pops the record with the smallest `(timestamp, seq)`.
    pub fn pop(&mut self) -> Option<BufferedRecord> {
        self.heap.pop().map(|Reverse(record)| record)
    }

    /// Puts back a popped record that could not be written.
    pub fn restore(&mut self, entry: BufferedRecord) {
        self.heap.push(Reverse(entry));
    }
}

/// Counters describing the memtable and its flusher.
#[derive(Debug, Default)]
pub struct MemTableStats {
    /// Records in the active buffer.
    pub buffered_records: AtomicUsize,
    /// Encoded bytes in the active buffer.
    pub buffered_bytes: AtomicUsize,
    /// Chunks rotated but not yet drained.
    pub queued_chunks: AtomicUsize,
    /// Chunks drained successfully.
    pub chunks_flushed: AtomicU64,
    /// Chunks aborted by an error.
    pub chunks_failed: AtomicU64,
    /// Records persisted by the sink.
    pub records_written: AtomicU64,
    /// Records rejected individually by the sink.
    pub records_rejected: AtomicU64,
    /// Records left behind in aborted chunks.
    pub records_lost: AtomicU64,
}

impl MemTableStats {
    /// Gets the number of records in the active buffer.
    pub fn buffered_records(&self) -> usize {
        self.buffered_records.load(Ordering::Relaxed)
    }

    /// Gets the encoded size of the active buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    /// Gets the number of chunks waiting for the flusher.
    pub fn queued_chunks(&self) -> usize {
        self.queued_chunks.load(Ordering::Relaxed)
    }

    /// Gets the number of successfully drained chunks.
    pub fn chunks_flushed(&self) -> u64 {
        self.chunks_flushed.load(Ordering::Relaxed)
    }

    /// Gets the number of aborted chunks.
    pub fn chunks_failed(&self) -> u64 {
        self.chunks_failed.load(Ordering::Relaxed)
    }

    /// Gets the number of persisted records.
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Gets the number of rejected records.
    pub fn records_rejected(&self) -> u64 {
        self.records_rejected.load(Ordering::Relaxed)
    }

    /// Gets the number of lost records.
    pub fn records_lost(&self) -> u64 {
        self.records_lost.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct ActiveBuffer {
    heap: BinaryHeap<Reverse<BufferedRecord>>,
    bytes: usize,
    min_seq: u64,
    max_seq: u64,
    opened_at: Option<Instant>,
    next_chunk_id: u64,
    closed: bool,
}

impl ActiveBuffer {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            bytes: 0,
            min_seq: u64::MAX,
            max_seq: 0,
            opened_at: None,
            next_chunk_id: 0,
            closed: false,
        }
    }

    fn push(&mut self, entry: BufferedRecord, size: usize) {
        self.opened_at.get_or_insert_with(Instant::now);
        self.min_seq = self.min_seq.min(entry.seq);
        self.max_seq = self.max_seq.max(entry.seq);
        self.bytes += size;
        self.heap.push(Reverse(entry));
    }

    fn is_full(&self, config: &MemTableConfig) -> bool {
        self.bytes >= config.max_bytes || self.heap.len() >= config.max_records
    }

    fn freeze(&mut self) -> FrozenBuffer {
        let frozen = FrozenBuffer {
            id: self.next_chunk_id,
            heap: std::mem::take(&mut self.heap),
            bytes: self.bytes,
            min_seq: self.min_seq,
            max_seq: self.max_seq,
        };
        self.next_chunk_id += 1;
        self.bytes = 0;
        self.min_seq = u64::MAX;
        self.max_seq = 0;
        self.opened_at = None;
        frozen
    }
}

#[derive(Debug, Default)]
struct FlushQueue {
    chunks: VecDeque<FrozenBuffer>,
    draining: bool,
    closed: bool,
    stopped: bool,
}

struct Shared {
    config: MemTableConfig,
    active: Mutex<ActiveBuffer>,
    queue: Mutex<FlushQueue>,
    work_ready: Condvar,
    idle: Condvar,
    stats: MemTableStats,
    watermark: FlushWatermark,
    sink: Arc<dyn FlushSink>,
}

impl Shared {
    /// Freezes the active buffer and enqueues it. Consumes the active guard.
    fn rotate_locked(&self, mut active: MutexGuard<'_, ActiveBuffer>, reason: &str) -> bool {
        if active.heap.is_empty() {
            return false;
        }
        let frozen = active.freeze();
        self.stats.buffered_records.store(0, Ordering::Relaxed);
        self.stats.buffered_bytes.store(0, Ordering::Relaxed);
        debug!(
            "Rotating memtable chunk {} ({}): {} records, {} bytes",
            frozen.id,
            reason,
            frozen.len(),
            frozen.bytes
        );

        let mut queue = self.queue.lock();
        queue.chunks.push_back(frozen);
        self.stats.queued_chunks.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        drop(active);

        self.work_ready.notify_one();
        true
    }

    fn rotate_if_idle(&self) {
        let active = self.active.lock();
        let idle = active
            .opened_at
            .is_some_and(|opened| opened.elapsed() >= self.config.idle_flush_interval);
        if idle {
            self.rotate_locked(active, "idle");
        }
    }

    fn drain(&self, mut chunk: FrozenBuffer) {
        let id = chunk.id;
        let total = chunk.len();
        let (min_seq, max_seq) = (chunk.min_seq, chunk.max_seq);

        match self.sink.flush_chunk(&mut chunk) {
            Ok(outcome) => {
                self.stats.chunks_flushed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .records_written
                    .fetch_add(outcome.written as u64, Ordering::Relaxed);
                self.stats
                    .records_rejected
                    .fetch_add(outcome.rejected as u64, Ordering::Relaxed);
                self.watermark.notify_flushed(max_seq);
                if outcome.rejected > 0 {
                    warn!(
                        "Memtable chunk {} flushed with {} of {} records rejected",
                        id, outcome.rejected, total
                    );
                } else {
                    debug!("Memtable chunk {} flushed: {} records", id, outcome.written);
                }
            }
            Err(e) => {
                let lost = chunk.len();
                self.stats.chunks_failed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .records_lost
                    .fetch_add(lost as u64, Ordering::Relaxed);
                self.watermark.notify_failed(min_seq);
                error!(
                    "Memtable chunk {} aborted after {} of {} records, {} records lost: {}",
                    id,
                    total - lost,
                    total,
                    lost,
                    e
                );
            }
        }

        if let Some(safe_seq) = self.watermark.safe_seq() {
            self.sink.checkpoint(safe_seq);
        }
    }
}

/// Marks the flusher as stopped even if the sink panics.
struct StopGuard<'a>(&'a Shared);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        let mut queue = self.0.queue.lock();
        queue.stopped = true;
        queue.draining = false;
        drop(queue);
        self.0.idle.notify_all();
    }
}

fn run_flusher(shared: Arc<Shared>) {
    let _guard = StopGuard(&shared);
    let poll = (shared.config.idle_flush_interval / 2).max(Duration::from_millis(1));

    loop {
        let chunk = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(chunk) = queue.chunks.pop_front() {
                    queue.draining = true;
                    break Some(chunk);
                }
                if queue.closed {
                    break None;
                }
                if shared.work_ready.wait_for(&mut queue, poll).timed_out() {
                    // Active lock is taken before the queue lock.
                    MutexGuard::unlocked(&mut queue, || shared.rotate_if_idle());
                }
            }
        };

        let Some(chunk) = chunk else {
            break;
        };
        shared.drain(chunk);
        shared.stats.queued_chunks.fetch_sub(1, Ordering::Relaxed);

        let mut queue = shared.queue.lock();
        queue.draining = false;
        drop(queue);
        shared.idle.notify_all();
    }

    debug!("Memtable flusher stopped");
}

/// Timestamp-ordered in-memory write buffer with an asynchronous flusher.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::memtable::MemTable;
///
/// let memtable = MemTable::new(MemTableConfig::default(), sink)?;
/// memtable.add(1, record)?;
/// memtable.flush_and_wait()?;
/// memtable.close()?;
/// ```
pub struct MemTable {
    shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl MemTable {
    /// Creates a memtable and starts its flusher thread.
    pub fn new(config: MemTableConfig, sink: Arc<dyn FlushSink>) -> Result<Self> {
        let shared = Arc::new(Shared {
            config,
            active: Mutex::new(ActiveBuffer::new()),
            queue: Mutex::new(FlushQueue::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            stats: MemTableStats::default(),
            watermark: FlushWatermark::new(),
            sink,
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("den-memtable-flusher".to_string())
            .spawn(move || run_flusher(worker))?;

        Ok(Self {
            shared,
            flusher: Mutex::new(Some(handle)),
        })
    }

    /// Buffers a record. Rotates the active buffer once it is full.
    pub fn add(&self, seq: u64, record: LogRecord) -> Result<()> {
        let size = record.encoded_len();
        let mut active = self.shared.active.lock();
        if active.closed {
            return Err(DenError::Closed);
        }
        active.push(BufferedRecord { seq, record }, size);
        self.shared
            .stats
            .buffered_records
            .store(active.heap.len(), Ordering::Relaxed);
        self.shared
            .stats
            .buffered_bytes
            .store(active.bytes, Ordering::Relaxed);

        if active.is_full(&self.shared.config) {
            self.shared.rotate_locked(active, "full");
        }
        Ok(())
    }

    /// Returns true if the active buffer reached a size or count threshold.
    pub fn is_full(&self) -> bool {
        self.shared.active.lock().is_full(&self.shared.config)
    }

    /// Records in the active buffer.
    pub fn len(&self) -> usize {
        self.shared.active.lock().heap.len()
    }

    /// Whether the active buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rotates the active buffer into the flush queue without waiting.
    pub fn flush(&self) -> Result<()> {
        let active = self.shared.active.lock();
        if active.closed {
            return Err(DenError::Closed);
        }
        self.shared.rotate_locked(active, "requested");
        Ok(())
    }

    /// Rotates the active buffer and waits until the queue is drained.
    pub fn flush_and_wait(&self) -> Result<()> {
        self.flush()?;
        self.wait_idle();
        Ok(())
    }

    /// Blocks until no chunk is queued or being drained.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while (queue.draining || !queue.chunks.is_empty()) && !queue.stopped {
            self.shared.idle.wait(&mut queue);
        }
    }

    /// Returns the counters.
    pub fn stats(&self) -> &MemTableStats {
        &self.shared.stats
    }

    /// Highest sequence number known to be persisted.
    pub fn safe_seq(&self) -> Option<u64> {
        self.shared.watermark.safe_seq()
    }

    /// Returns the flush watermark.
    pub fn watermark(&self) -> &FlushWatermark {
        &self.shared.watermark
    }

    /// Rejects further writes, drains every buffered record and joins the flusher.
    pub fn close(&self) -> Result<()> {
        let mut active = self.shared.active.lock();
        if !active.closed {
            active.closed = true;
            self.shared.rotate_locked(active, "close");
        } else {
            drop(active);
        }

        let mut queue = self.shared.queue.lock();
        queue.closed = true;
        drop(queue);
        self.shared.work_ready.notify_all();

        if let Some(handle) = self.flusher.lock().take() {
            handle
                .join()
                .map_err(|_| io::Error::other("memtable flusher panicked"))?;
        }
        Ok(())
    }
}

impl Drop for MemTable {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close memtable on drop: {}", e);
        }
    }
}
