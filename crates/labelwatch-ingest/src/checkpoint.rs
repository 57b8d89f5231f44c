//! Firehose resume checkpoint.
//!
//! The ingester reports every delivered sequence to a [`CheckpointTracker`];
//! a [`CheckpointWriter`] persists it on a fixed interval, decoupled from
//! per-event latency. Tasks complete out of order, so the tracker keeps the
//! maximum rather than the latest value and the stored checkpoint only ever
//! moves forward.
//!
//! Delivered is not processed. When the writer knows the [`CommitQueue`] it
//! holds the checkpoint just below the lowest commit still queued or
//! running, so a crash replays unfinished work instead of losing it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use labelwatch_core::metrics::set_gauge;
use tracing::{debug, info, warn};

use crate::Result;
use crate::queue::CommitQueue;
use crate::store::LabelStore;

const UNSET: i64 = -1;

/// Highest sequence delivered so far.
#[derive(Debug)]
pub struct CheckpointTracker {
    highest: AtomicI64,
}

impl Default for CheckpointTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CheckpointTracker {
    pub fn new(start: Option<i64>) -> Self {
        Self {
            highest: AtomicI64::new(start.unwrap_or(UNSET)),
        }
    }

    pub fn observe(&self, sequence: i64) {
        self.highest.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Move back to `sequence` if the tracker is past it, e.g. when work
    /// above it was discarded and will be delivered again.
    pub fn rewind(&self, sequence: i64) {
        self.highest.fetch_min(sequence, Ordering::AcqRel);
    }

    pub fn highest(&self) -> Option<i64> {
        Some(self.highest.load(Ordering::Acquire)).filter(|seq| *seq != UNSET)
    }
}

/// Periodically persists the tracker's value to the store.
pub struct CheckpointWriter {
    store: Arc<LabelStore>,
    tracker: Arc<CheckpointTracker>,
    interval: Duration,
    queue: Option<Arc<CommitQueue>>,
    written: AtomicI64,
}

impl CheckpointWriter {
    pub fn new(store: Arc<LabelStore>, tracker: Arc<CheckpointTracker>, interval: Duration) -> Self {
        Self {
            store,
            tracker,
            interval,
            queue: None,
            written: AtomicI64::new(UNSET),
        }
    }

    /// Hold the checkpoint below unfinished commits of `queue`.
    pub fn with_queue(mut self, queue: Arc<CommitQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Highest sequence that is safe to resume after.
    pub fn safe_sequence(&self) -> Option<i64> {
        // Read the tracker first: anything it covers was submitted before,
        // so it is either finished or visible in the queue below.
        let highest = self.tracker.highest()?;
        match self.queue.as_ref().and_then(|q| q.lowest_unfinished()) {
            Some(lowest) if lowest <= highest => Some(lowest - 1).filter(|seq| *seq >= 0),
            _ => Some(highest),
        }
    }

    /// Persist the safe value if it moved. Returns the value written.
    pub fn write_now(&self) -> Result<Option<i64>> {
        let Some(sequence) = self.safe_sequence() else {
            return Ok(None);
        };
        if sequence <= self.written.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.store.update_last_sequence(sequence)?;
        self.written.fetch_max(sequence, Ordering::AcqRel);
        set_gauge("checkpoint_sequence", sequence as f64);
        debug!("Checkpointed firehose sequence {}", sequence);
        Ok(Some(sequence))
    }

    /// Write every interval until `shutdown` is set, then write once more.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let tick = self.interval.min(Duration::from_secs(1));
        let mut last_write = tokio::time::Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(tick).await;
            if last_write.elapsed() < self.interval {
                continue;
            }
            last_write = tokio::time::Instant::now();
            if let Err(e) = self.write_now() {
                warn!("Failed to write checkpoint: {}", e);
            }
        }

        match self.write_now() {
            Ok(Some(sequence)) => info!("Final checkpoint at sequence {}", sequence),
            Ok(None) => {}
            Err(e) => warn!("Failed to write final checkpoint: {}", e),
        }
    }
}
