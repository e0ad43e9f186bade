//! Flush watermark tracking for durable buffer release.

use std::sync::RwLock;

#[derive(Debug, Default)]
struct WatermarkState {
    flushed: Option<u64>,
    failed_floors: Vec<u64>,
}

/// Tracks the highest sequence number known to be persisted in the page store.
///
/// Every drained chunk reports either its highest sequence (success) or its
/// lowest sequence (failure). A failed chunk pins the watermark below its
/// floor until the failure is resolved, so a fronting WAL never releases
/// records that did not reach a partition file.
///
/// # Examples
/// ```rust,ignore
/// use alopex_den::memtable::FlushWatermark;
///
/// let watermark = FlushWatermark::new();
/// watermark.notify_flushed(42);
/// assert_eq!(watermark.safe_seq(), Some(42));
/// ```
#[derive(Debug, Default)]
pub struct FlushWatermark {
    inner: RwLock<WatermarkState>,
}

impl FlushWatermark {
    /// Creates a new watermark with nothing flushed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successfully drained chunk whose highest sequence is `max_seq`.
    pub fn notify_flushed(&self, max_seq: u64) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.flushed = Some(state.flushed.map_or(max_seq, |seq| seq.max(max_seq)));
    }

    /// Records an aborted chunk whose lowest sequence is `min_seq`.
    pub fn notify_failed(&self, min_seq: u64) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        if !state.failed_floors.contains(&min_seq) {
            state.failed_floors.push(min_seq);
        }
    }

    /// Clears a failure floor once its records were recovered out of band.
    pub fn resolve_failure(&self, min_seq: u64) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.failed_floors.retain(|&floor| floor != min_seq);
    }

    /// Lowest sequences of the chunks still pinning the watermark, ascending.
    pub fn failed_floors(&self) -> Vec<u64> {
        let state = self.inner.read().unwrap_or_else(|err| err.into_inner());
        let mut floors = state.failed_floors.clone();
        floors.sort_unstable();
        floors
    }

    /// Calculates the safe sequence for durable buffer release.
    ///
    /// Formula: min(flushed, min(failed_floor) - 1).
    /// Returns None if no chunk has been flushed.
    pub fn safe_seq(&self) -> Option<u64> {
        let state = self.inner.read().unwrap_or_else(|err| err.into_inner());
        let flushed = state.flushed?;

        let safe = match state.failed_floors.iter().copied().min() {
            Some(floor) => flushed.min(floor.saturating_sub(1)),
            None => flushed,
        };
        Some(safe)
    }
}
