//! Backpressured, stall-detecting firehose stream.
//!
//! # Architecture
//!
//! ```text
//! transport ──► receive task ──► bounded channel ──► FirehoseStream::next_event()
//!                  │   (max_pending frames)              │
//!                  │                                     ├─ decode frame → ready events
//!                  └─ graduated sleep when occupancy     ├─ drop frames at or below the
//!                     passes the threshold, blocking     │  last delivered sequence
//!                     send when full                     └─ stall check every tick while
//!                                                           the buffer is empty
//! ```
//!
//! The receive task never drops a frame: when the channel is full it waits.
//! Above `backpressure_threshold` occupancy it also sleeps for a delay that
//! grows with occupancy, so a slow consumer slows the socket down gradually
//! instead of in hard stops.
//!
//! `last_sequence` only moves once every event of a frame has been handed
//! out, so reopening with it as the cursor resumes exactly after the last
//! delivered event.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use labelwatch_core::CommitEvent;
use labelwatch_core::metrics::{increment, set_gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frame::{DecodedFrame, decode_frame};
use super::transport::{FrameTransport, TransportConnector};
use crate::{Error, Result};

/// Configuration for the firehose stream.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Maximum silent gap before the stream is considered stalled.
    pub timeout: Duration,

    /// Maximum number of raw frames buffered ahead of decoding.
    pub max_pending: usize,

    /// Buffer occupancy (0.0-1.0) above which the receive task starts
    /// throttling itself.
    pub backpressure_threshold: f64,

    /// Throttle delay at a completely full buffer.
    pub max_backpressure_delay: Duration,

    /// Decode-loop tick used for stall checks while no frames arrive.
    /// `None` derives it from the timeout (a tenth, at least 100ms).
    pub poll_interval: Option<Duration>,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            max_pending: 5000,
            backpressure_threshold: 0.8,
            max_backpressure_delay: Duration::from_millis(250),
            poll_interval: None,
        }
    }
}

impl FirehoseConfig {
    pub fn tick(&self) -> Duration {
        self.poll_interval
            .unwrap_or_else(|| (self.timeout / 10).max(Duration::from_millis(100)))
    }

    /// Throttle delay for a given buffer occupancy.
    pub fn backpressure_delay(&self, occupancy: f64) -> Duration {
        if occupancy < self.backpressure_threshold || self.backpressure_threshold >= 1.0 {
            return Duration::ZERO;
        }
        let over = (occupancy - self.backpressure_threshold) / (1.0 - self.backpressure_threshold);
        self.max_backpressure_delay.mul_f64(over.clamp(0.0, 1.0))
    }
}

/// Counters shared between the receive task and the stream.
#[derive(Debug, Default)]
pub struct StreamStats {
    frames_received: AtomicU64,
    frames_decoded: AtomicU64,
    events_emitted: AtomicU64,
    decode_errors: AtomicU64,
    duplicate_frames: AtomicU64,
    throttled: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub events_emitted: u64,
    pub decode_errors: u64,
    pub duplicate_frames: u64,
    pub throttled: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            duplicate_frames: self.duplicate_frames.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

/// Opens firehose subscriptions.
pub struct StreamIngester {
    connector: Arc<dyn TransportConnector>,
    config: FirehoseConfig,
}

impl StreamIngester {
    pub fn new(connector: Arc<dyn TransportConnector>, config: FirehoseConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &FirehoseConfig {
        &self.config
    }

    /// Open a subscription.
    ///
    /// `start_sequence` is the last sequence already delivered; the stream
    /// resumes after it. `None` or a negative value starts from the live head.
    pub async fn open(&self, start_sequence: Option<i64>) -> Result<FirehoseStream> {
        let start = start_sequence.filter(|s| *s >= 0);
        match start {
            Some(seq) => tracing::info!("Firehose resuming after seq {}", seq),
            None => tracing::info!("Firehose starting from live head"),
        }

        let transport = self.connector.connect(start).await?;
        Ok(FirehoseStream::spawn(transport, start, self.config.clone()))
    }
}

enum Received {
    Frame(Vec<u8>),
    Failed(Error),
    Closed,
}

/// An open subscription yielding [`CommitEvent`]s in sequence order.
///
/// Dropping the stream stops the receive task.
pub struct FirehoseStream {
    rx: mpsc::Receiver<Received>,
    ready: VecDeque<CommitEvent>,
    /// Sequence of the frame whose events are in `ready`.
    ready_sequence: Option<i64>,
    last_sequence: Option<i64>,
    last_activity: Instant,
    replaying: bool,
    config: FirehoseConfig,
    stats: Arc<StreamStats>,
    receiver: JoinHandle<()>,
}

impl FirehoseStream {
    fn spawn(
        transport: Box<dyn FrameTransport>,
        start: Option<i64>,
        config: FirehoseConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.max_pending.max(1));
        let stats = Arc::new(StreamStats::default());
        let receiver = tokio::spawn(receive_loop(transport, tx, config.clone(), stats.clone()));

        Self {
            rx,
            ready: VecDeque::new(),
            ready_sequence: None,
            last_sequence: start,
            last_activity: Instant::now(),
            // Nothing decoded yet; stall checks start with the first frame.
            replaying: true,
            config,
            stats,
            receiver,
        }
    }

    /// Highest sequence whose events have all been delivered.
    pub fn last_sequence(&self) -> Option<i64> {
        self.last_sequence
    }

    /// Whether stall detection is currently suppressed.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Next event, in order.
    ///
    /// Fails with [`Error::StreamStalled`] when nothing has arrived for
    /// longer than the timeout, with [`Error::Upstream`] on an error frame,
    /// and with [`Error::StreamClosed`] or a transport error when the
    /// subscription ends.
    pub async fn next_event(&mut self) -> Result<CommitEvent> {
        let tick = self.config.tick();

        loop {
            if let Some(event) = self.ready.pop_front() {
                if self.ready.is_empty() {
                    if let Some(seq) = self.ready_sequence.take() {
                        self.advance(seq);
                    }
                }
                self.last_activity = Instant::now();
                self.stats.events_emitted.fetch_add(1, Ordering::Relaxed);
                increment("firehose_events_total", 1);
                return Ok(event);
            }

            // Frames already buffered are activity even if the consumer was slow.
            let received = match self.rx.try_recv() {
                Ok(received) => Some(received),
                Err(mpsc::error::TryRecvError::Disconnected) => None,
                Err(mpsc::error::TryRecvError::Empty) => {
                    self.check_stall()?;
                    tokio::select! {
                        received = self.rx.recv() => received,
                        _ = tokio::time::sleep(tick) => continue,
                    }
                }
            };

            set_gauge("firehose_pending_frames", self.rx.len() as f64);

            match received {
                Some(Received::Frame(bytes)) => self.handle_frame(&bytes)?,
                Some(Received::Failed(e)) => return Err(e),
                Some(Received::Closed) | None => return Err(Error::StreamClosed),
            }
        }
    }

    fn check_stall(&self) -> Result<()> {
        if self.replaying {
            return Ok(());
        }
        let silent_for = self.last_activity.elapsed();
        if silent_for > self.config.timeout {
            tracing::error!(
                "No firehose events for {}s (last seq {:?})",
                silent_for.as_secs(),
                self.last_sequence
            );
            increment("firehose_stalls_total", 1);
            return Err(Error::StreamStalled { silent_for });
        }
        Ok(())
    }

    fn handle_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let decoded = match decode_frame(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                increment("firehose_decode_errors_total", 1);
                tracing::warn!("Skipping undecodable frame ({} bytes): {}", bytes.len(), e);
                return Ok(());
            }
        };
        self.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);

        let delivered = self.last_sequence;
        if let Some(seq) = decoded.sequence().filter(|s| delivered.is_some_and(|last| *s <= last)) {
            self.stats.duplicate_frames.fetch_add(1, Ordering::Relaxed);
            increment("firehose_duplicate_frames_total", 1);
            tracing::debug!("Dropping already delivered seq {}", seq);
            return Ok(());
        }

        match decoded {
            DecodedFrame::Events { sequence, events } => {
                if self.replaying {
                    tracing::info!("Firehose events flowing at seq {}", sequence);
                }
                self.replaying = false;
                self.last_activity = Instant::now();
                if events.is_empty() {
                    self.advance(sequence);
                } else {
                    self.ready.extend(events);
                    self.ready_sequence = Some(sequence);
                }
            }
            DecodedFrame::Ignored { kind, sequence } => {
                tracing::trace!("Ignoring {} frame", kind);
                if let Some(seq) = sequence {
                    self.replaying = false;
                    self.last_activity = Instant::now();
                    self.advance(seq);
                }
            }
            DecodedFrame::OutdatedCursor => {
                tracing::warn!("Cursor is outdated, upstream is replaying; waiting");
                self.replaying = true;
            }
            DecodedFrame::Info { name, message } => {
                tracing::info!("Firehose info {}: {}", name, message.unwrap_or_default());
            }
            DecodedFrame::Error { error, message } => {
                tracing::error!("Firehose error frame {}: {}", error, message);
                return Err(Error::Upstream { error, message });
            }
        }
        Ok(())
    }

    fn advance(&mut self, sequence: i64) {
        if self.last_sequence.is_none_or(|last| sequence > last) {
            self.last_sequence = Some(sequence);
            set_gauge("firehose_last_sequence", sequence as f64);
        }
    }
}

impl Drop for FirehoseStream {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(
    mut transport: Box<dyn FrameTransport>,
    tx: mpsc::Sender<Received>,
    config: FirehoseConfig,
    stats: Arc<StreamStats>,
) {
    let capacity = tx.max_capacity() as f64;

    loop {
        let frame = match transport.next_frame().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!("Firehose transport error: {}", e);
                let _ = tx.send(Received::Failed(e)).await;
                return;
            }
            None => {
                let _ = tx.send(Received::Closed).await;
                return;
            }
        };
        stats.frames_received.fetch_add(1, Ordering::Relaxed);
        increment("firehose_frames_total", 1);

        let occupancy = (capacity - tx.capacity() as f64) / capacity;
        let delay = config.backpressure_delay(occupancy);
        if !delay.is_zero() {
            stats.throttled.fetch_add(1, Ordering::Relaxed);
            metrics::histogram!("firehose_backpressure_seconds").record(delay.as_secs_f64());
            tokio::time::sleep(delay).await;
        }

        // Blocks while the buffer is full.
        if tx.send(Received::Frame(frame)).await.is_err() {
            return;
        }
    }
}
