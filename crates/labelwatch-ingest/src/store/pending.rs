//! Write buffer for label operations.
//!
//! Decisions arrive one commit at a time; writing each immediately would
//! mean a SQLite transaction per commit. The buffer flushes when it holds
//! `max_pending` operations or its oldest entry has waited `max_wait`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use labelwatch_core::LabelOperation;
use labelwatch_core::metrics::increment;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{LabelSink, LabelStore};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct PendingConfig {
    /// Flush once this many operations are buffered.
    pub max_pending: usize,
    /// Flush once the oldest buffered operation is this old.
    pub max_wait: Duration,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            max_pending: 64,
            max_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Buffer {
    operations: Vec<LabelOperation>,
    oldest: Option<Instant>,
}

/// Buffered [`LabelSink`] in front of a [`LabelStore`].
pub struct PendingOperations {
    store: Arc<LabelStore>,
    config: PendingConfig,
    buffer: Mutex<Buffer>,
    flushes: tokio::sync::Mutex<()>,
}

impl PendingOperations {
    pub fn new(store: Arc<LabelStore>, config: PendingConfig) -> Self {
        Self {
            store,
            config,
            buffer: Mutex::new(Buffer::default()),
            flushes: tokio::sync::Mutex::new(()),
        }
    }

    /// Operations waiting to be written.
    pub fn len(&self) -> usize {
        self.buffer.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write everything buffered. Returns the number of operations written.
    ///
    /// A failed write is logged and its operations dropped.
    pub async fn flush(&self) -> usize {
        let _guard = self.flushes.lock().await;
        let operations = {
            let mut buffer = self.buffer.lock();
            buffer.oldest = None;
            std::mem::take(&mut buffer.operations)
        };
        if operations.is_empty() {
            return 0;
        }

        let count = operations.len();
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.insert_operations(&operations))
            .await
            .map_err(|e| Error::TaskAborted(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(written) => {
                debug!("Flushed {} label operations", written);
                written
            }
            Err(e) => {
                error!("Failed to insert {} label operations: {}", count, e);
                0
            }
        }
    }

    /// Flush on the age limit until `shutdown` is set, then flush the rest.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let tick = (self.config.max_wait / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            let due = self
                .buffer
                .lock()
                .oldest
                .is_some_and(|t| t.elapsed() >= self.config.max_wait);
            if due {
                self.flush().await;
            }
        }

        let written = self.flush().await;
        info!("Pending label writer stopped ({} flushed on shutdown)", written);
    }
}

#[async_trait]
impl LabelSink for PendingOperations {
    async fn submit(&self, operations: Vec<LabelOperation>) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        increment("labels_queued_total", operations.len() as u64);
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.oldest.get_or_insert_with(Instant::now);
            buffer.operations.extend(operations);
            buffer.operations.len() >= self.config.max_pending
        };
        if full {
            self.flush().await;
        }
        Ok(())
    }
}
