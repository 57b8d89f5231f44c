//! Host loop tying the stream to the queue.
//!
//! [`Labeler::run`] opens a firehose session, hands every event to the
//! [`CommitQueue`], and records delivered sequences with the
//! [`CheckpointTracker`]. Session errors (stalls, remote close, upstream
//! error frames, transport failures) reconnect with exponential backoff;
//! anything else ends the run.
//!
//! A stall also resets the queue: work in flight is abandoned and the cursor
//! rewinds to just before the lowest abandoned sequence, so those commits are
//! delivered again by the next session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointTracker;
use crate::firehose::{FirehoseStream, StreamIngester};
use crate::processor::Caches;
use crate::queue::CommitQueue;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// First reconnect delay; doubles per consecutive failure.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// How often the shutdown flag is checked while waiting.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Totals of one [`Labeler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Events read from the firehose.
    pub events: u64,
    /// Events the queue accepted.
    pub submitted: u64,
    pub sessions: u32,
    pub stalls: u32,
    /// Cursor at exit.
    pub last_sequence: Option<i64>,
}

enum SessionEnd {
    Shutdown,
    Failed(Error),
}

pub struct Labeler {
    ingester: StreamIngester,
    queue: Arc<CommitQueue>,
    tracker: Arc<CheckpointTracker>,
    config: PipelineConfig,
}

impl Labeler {
    pub fn new(
        ingester: StreamIngester,
        queue: Arc<CommitQueue>,
        tracker: Arc<CheckpointTracker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ingester,
            queue,
            tracker,
            config,
        }
    }

    /// Run sessions from `start` until `shutdown` is set.
    ///
    /// Only errors that are not session errors are returned.
    pub async fn run(&self, start: Option<i64>, shutdown: Arc<AtomicBool>) -> Result<PipelineSummary> {
        let mut summary = PipelineSummary {
            last_sequence: start,
            ..PipelineSummary::default()
        };
        let mut delay = self.config.reconnect_delay;

        while !shutdown.load(Ordering::SeqCst) {
            summary.sessions += 1;
            let events_before = summary.events;

            let err = match self.session(&mut summary, &shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(err) => err,
            };

            let Some(reason) = err.session_reason() else {
                error!("Firehose session failed: {}", err);
                return Err(err);
            };
            metrics::counter!("firehose_reconnects_total", "reason" => reason).increment(1);

            match &err {
                Error::StreamStalled { .. } => {
                    summary.stalls += 1;
                    // Pull the checkpoint back before the queue forgets the work.
                    if let Some(lowest) = self.queue.lowest_unfinished() {
                        self.tracker.rewind(lowest - 1);
                    }
                    let reset = self.queue.reset();
                    if let Some(lowest) = reset.lowest_sequence {
                        let rewind = lowest - 1;
                        summary.last_sequence = Some(summary.last_sequence.map_or(rewind, |c| c.min(rewind)));
                    }
                    warn!(
                        "Queue reset after stall: {} queued discarded, {} running abandoned, resuming after {:?}",
                        reset.discarded, reset.abandoned, summary.last_sequence
                    );
                }
                Error::Upstream { error, .. } if error == "FutureCursor" => {
                    warn!("Cursor {:?} is ahead of the relay, resuming from live head", summary.last_sequence);
                    summary.last_sequence = None;
                }
                _ => {}
            }

            if summary.events > events_before {
                delay = self.config.reconnect_delay;
            }
            warn!("Firehose session ended: {}; reconnecting in {:?}", err, delay);
            if wait_or_shutdown(delay, &shutdown, self.config.poll_interval).await {
                break;
            }
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }

        info!(
            "Firehose stopped after {} sessions: {} events read, {} submitted, {} stalls",
            summary.sessions, summary.events, summary.submitted, summary.stalls
        );
        Ok(summary)
    }

    async fn session(&self, summary: &mut PipelineSummary, shutdown: &AtomicBool) -> SessionEnd {
        let mut stream = match self.ingester.open(summary.last_sequence).await {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::Failed(e),
        };

        while !shutdown.load(Ordering::SeqCst) {
            // Timeout to periodically check the shutdown flag; next_event is cancel-safe.
            let event = match tokio::time::timeout(self.config.poll_interval, stream.next_event()).await {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    self.note_delivered(&stream, summary);
                    return SessionEnd::Failed(e);
                }
                Err(_) => continue,
            };
            summary.events += 1;

            let accepted = tokio::select! {
                accepted = self.queue.submit(event) => accepted,
                _ = wait_for_flag(shutdown, self.config.poll_interval) => return SessionEnd::Shutdown,
            };
            if accepted {
                summary.submitted += 1;
            }
            self.note_delivered(&stream, summary);
        }

        debug!("Firehose session stopping at {:?}", summary.last_sequence);
        SessionEnd::Shutdown
    }

    fn note_delivered(&self, stream: &FirehoseStream, summary: &mut PipelineSummary) {
        if let Some(sequence) = stream.last_sequence() {
            self.tracker.observe(sequence);
            summary.last_sequence = Some(sequence);
        }
    }
}

async fn wait_for_flag(flag: &AtomicBool, poll: Duration) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(poll).await;
    }
}

/// Sleep for `delay`. Returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &AtomicBool, poll: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => shutdown.load(Ordering::SeqCst),
        _ = wait_for_flag(shutdown, poll) => true,
    }
}

/// Periodic health line for the caches and the queue.
pub struct StatsReporter {
    caches: Caches,
    queue: Arc<CommitQueue>,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(caches: Caches, queue: Arc<CommitQueue>, interval: Duration) -> Self {
        Self {
            caches,
            queue,
            interval,
        }
    }

    /// Log counters since the last report and scavenge the caches.
    pub fn report(&self) {
        for (name, stats) in self.caches.take_stats() {
            info!(
                "cache {}: {} entries, {} hits, {} misses ({:.1}% hit rate), {} coalesced, {} expired, {} timeouts, {} batches",
                name,
                stats.entries,
                stats.hits,
                stats.misses,
                stats.hit_rate(),
                stats.coalesced,
                stats.expired,
                stats.timeouts,
                stats.batches
            );
        }

        let queue = self.queue.stats();
        info!(
            "queue: {} queued, {} running, {} completed, {} failed, {} timeouts, {} retries, {} skipped",
            queue.queued,
            queue.running,
            queue.completed,
            queue.failed,
            queue.timeouts,
            queue.retries,
            queue.skipped
        );

        let removed = self.caches.scavenge();
        if removed > 0 {
            debug!("Scavenged {} cache entries", removed);
        }
    }

    pub async fn run(self, shutdown: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        while !shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => self.report(),
                _ = wait_for_flag(&shutdown, Duration::from_secs(1)) => break,
            }
        }
    }
}
