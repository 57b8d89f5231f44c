//! Bounded-concurrency commit processing.
//!
//! The queue sits between the firehose reader and the decision pipeline.
//! Submitters block once the backlog reaches its ceiling, so a slow decision
//! path throttles ingestion instead of growing memory.
//!
//! # Task lifecycle
//!
//! ```text
//! submit ──► queued ──► running ──► completed
//!              ▲           │
//!              │           ├── failed / timed out, retries left ──► queued (after backoff)
//!              │           └── failed / timed out, no retries  ──► skipped (logged once)
//! ```
//!
//! Timeouts abandon an attempt without aborting it. The handler's spawned
//! work keeps running and may still write its side effects; downstream label
//! writes are idempotent set operations so a late completion is harmless.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use labelwatch_core::metrics::{increment, set_gauge};
use labelwatch_core::{CommitEvent, EventKey, OpAction, RecordType};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Decides on one commit. Implemented by the labeling processor.
#[async_trait]
pub trait CommitHandler: Send + Sync + 'static {
    async fn process(&self, event: Arc<CommitEvent>) -> Result<()>;
}

/// Configuration for a [`CommitQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum tasks running at once.
    pub max_concurrency: usize,

    /// Submitters block once `max_concurrency * depth_multiplier` tasks are queued.
    pub depth_multiplier: usize,

    /// Time budget of one attempt.
    pub max_processing_time: Duration,

    /// Attempts after the first before a commit is skipped for good.
    pub max_retries: u32,

    /// Delay before a failed commit is attempted again.
    pub retry_backoff: Duration,

    /// Scheduling tick of the driver loop.
    pub tick: Duration,

    /// Bound on the permanently-skipped set; cleared when exceeded.
    pub skipped_capacity: usize,

    /// Record types the decision rules act on.
    pub accepted: Vec<RecordType>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 256,
            depth_multiplier: 2,
            max_processing_time: Duration::from_secs(120),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),
            tick: Duration::from_millis(50),
            skipped_capacity: 100_000,
            accepted: vec![RecordType::Post, RecordType::Profile, RecordType::IdentityChange],
        }
    }
}

impl QueueConfig {
    /// Maximum queued (not yet running) tasks before `submit` blocks.
    pub fn ceiling(&self) -> usize {
        (self.max_concurrency * self.depth_multiplier).max(1)
    }

    /// Whether the rules have anything to do with this event.
    ///
    /// Deletes are never actionable; post edits are not either.
    pub fn accepts(&self, event: &CommitEvent) -> bool {
        if !self.accepted.contains(&event.record_type) {
            return false;
        }
        match event.record_type {
            RecordType::Post => event.action == OpAction::Create,
            RecordType::Profile => matches!(event.action, OpAction::Create | OpAction::Update),
            _ => event.action != OpAction::Delete,
        }
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub skipped: u64,
    pub rejected: u64,
}

/// What [`CommitQueue::reset`] discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    /// Queued tasks dropped.
    pub discarded: usize,
    /// Running tasks whose results will be ignored.
    pub abandoned: usize,
    /// Lowest sequence among dropped and abandoned tasks.
    pub lowest_sequence: Option<i64>,
}

struct Task {
    event: Arc<CommitEvent>,
    attempt: u32,
    not_before: Option<Instant>,
    generation: u64,
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<Task>,
    running: HashSet<EventKey>,
    /// Failed attempts per event still eligible for retry.
    failures: HashMap<EventKey, u32>,
    /// Events that exhausted their retries.
    skipped: HashSet<EventKey>,
    generation: u64,
}

impl QueueState {
    fn lowest_sequence(&self) -> Option<i64> {
        self.queued
            .iter()
            .map(|t| t.event.sequence)
            .chain(self.running.iter().map(|k| k.sequence))
            .min()
    }
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
}

/// Bounded-concurrency commit queue. Share it behind an `Arc`.
pub struct CommitQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Signalled when queued depth drops.
    space: Notify,
    /// Signalled when new work is queued.
    work: Notify,
    shutdown: AtomicBool,
    counters: Counters,
}

type Finished = (Task, Result<()>);

impl CommitQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            space: Notify::new(),
            work: Notify::new(),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue an event for processing.
    ///
    /// Returns `false` without queueing for events the rules ignore, events
    /// already skipped for good, and after [`shutdown`](Self::shutdown).
    /// Waits while the backlog is at its ceiling.
    pub async fn submit(&self, event: CommitEvent) -> bool {
        if !self.config.accepts(&event) {
            self.reject();
            return false;
        }
        let key = event.key();
        let event = Arc::new(event);
        let ceiling = self.config.ceiling();

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return false;
            }

            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.skipped.contains(&key) {
                    drop(state);
                    self.reject();
                    return false;
                }
                if state.queued.len() < ceiling {
                    let generation = state.generation;
                    state.queued.push_back(Task {
                        event,
                        attempt: 0,
                        not_before: None,
                        generation,
                    });
                    set_gauge("queue_depth", state.queued.len() as f64);
                    drop(state);
                    self.work.notify_one();
                    return true;
                }
            }

            tokio::select! {
                _ = &mut space => {}
                _ = tokio::time::sleep(self.config.tick) => {}
            }
        }
    }

    /// Drive the queue until [`shutdown`](Self::shutdown) and the backlog drains.
    ///
    /// Task failures never end this loop.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn CommitHandler>) -> Result<()> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Finished>();
        info!(
            "Commit queue started (concurrency {}, ceiling {}, timeout {:?})",
            self.config.max_concurrency,
            self.config.ceiling(),
            self.config.max_processing_time
        );

        loop {
            while let Ok((task, outcome)) = done_rx.try_recv() {
                self.finish(task, outcome);
            }

            if self.shutdown.load(Ordering::Acquire) {
                let state = self.state.lock();
                if state.queued.is_empty() && state.running.is_empty() {
                    break;
                }
            }

            for task in self.take_launchable() {
                self.launch(task, handler.clone(), done_tx.clone());
            }

            tokio::select! {
                Some((task, outcome)) = done_rx.recv() => self.finish(task, outcome),
                _ = self.work.notified() => {}
                _ = tokio::time::sleep(self.config.tick) => {}
            }
        }

        info!("Commit queue drained");
        Ok(())
    }

    /// Drop all queued and running bookkeeping, e.g. after a stream stall.
    ///
    /// Running attempts are not aborted, but their results are ignored.
    pub fn reset(&self) -> ResetSummary {
        let summary = {
            let mut state = self.state.lock();
            let lowest_sequence = state.lowest_sequence();
            let summary = ResetSummary {
                discarded: state.queued.len(),
                abandoned: state.running.len(),
                lowest_sequence,
            };
            state.queued.clear();
            state.running.clear();
            state.failures.clear();
            state.generation += 1;
            summary
        };
        set_gauge("queue_depth", 0.0);
        set_gauge("queue_running", 0.0);
        self.space.notify_waiters();
        summary
    }

    /// Lowest sequence still queued or running.
    pub fn lowest_unfinished(&self) -> Option<i64> {
        self.state.lock().lowest_sequence()
    }

    /// Stop accepting submissions; [`run`](Self::run) returns once drained.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.space.notify_waiters();
        self.work.notify_one();
    }

    pub fn stats(&self) -> QueueStats {
        let (queued, running) = {
            let state = self.state.lock();
            (state.queued.len(), state.running.len())
        };
        QueueStats {
            queued,
            running,
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        increment("queue_rejected_total", 1);
    }

    /// Pop up to the free concurrency worth of ready tasks and mark them running.
    ///
    /// Tasks still backing off, or whose event is already running, stay queued
    /// in their original order.
    fn take_launchable(&self) -> Vec<Task> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let available = self.config.max_concurrency.saturating_sub(state.running.len());
        if available == 0 || state.queued.is_empty() {
            return Vec::new();
        }

        let mut launch = Vec::new();
        let mut deferred = Vec::new();
        while launch.len() < available {
            let Some(task) = state.queued.pop_front() else {
                break;
            };
            let key = task.event.key();
            if task.not_before.is_some_and(|t| t > now) || state.running.contains(&key) {
                deferred.push(task);
                continue;
            }
            state.running.insert(key);
            launch.push(task);
        }
        for task in deferred.into_iter().rev() {
            state.queued.push_front(task);
        }

        set_gauge("queue_depth", state.queued.len() as f64);
        set_gauge("queue_running", state.running.len() as f64);
        drop(state);

        if !launch.is_empty() {
            self.space.notify_waiters();
        }
        launch
    }

    fn launch(&self, task: Task, handler: Arc<dyn CommitHandler>, done: mpsc::UnboundedSender<Finished>) {
        let limit = self.config.max_processing_time;
        tokio::spawn(async move {
            let key = task.event.key();
            let work = tokio::spawn({
                let event = task.event.clone();
                async move { handler.process(event).await }
            });
            // Dropping the JoinHandle on timeout detaches the work; it is not aborted.
            let outcome = match tokio::time::timeout(limit, work).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(Error::TaskAborted(join_error.to_string())),
                Err(_) => Err(Error::ProcessCommitTimeout { key, after: limit }),
            };
            let _ = done.send((task, outcome));
        });
    }

    fn finish(&self, task: Task, outcome: Result<()>) {
        let key = task.event.key();
        let mut state = self.state.lock();
        if task.generation != state.generation {
            debug!("Ignoring result of {} from before queue reset", key);
            return;
        }
        state.running.remove(&key);
        set_gauge("queue_running", state.running.len() as f64);

        let error = match outcome {
            Ok(()) => {
                state.failures.remove(&key);
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                increment("queue_completed_total", 1);
                return;
            }
            Err(e) => e,
        };

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        increment("queue_failed_total", 1);
        if matches!(error, Error::ProcessCommitTimeout { .. }) {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            increment("queue_timeouts_total", 1);
        }

        let failures = {
            let count = state.failures.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        if failures > self.config.max_retries {
            state.failures.remove(&key);
            if state.skipped.len() >= self.config.skipped_capacity {
                state.skipped.clear();
            }
            state.skipped.insert(key);
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            increment("queue_skipped_total", 1);
            warn!(
                "Permanently skipping commit {} ({} {}) after {} attempts: {}",
                key, task.event.record_type, task.event.repo, failures, error
            );
            return;
        }

        debug!("Retrying commit {} (attempt {}): {}", key, task.attempt + 1, error);
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
        increment("queue_retries_total", 1);
        state.queued.push_back(Task {
            attempt: task.attempt + 1,
            not_before: Some(Instant::now() + self.config.retry_backoff),
            ..task
        });
        set_gauge("queue_depth", state.queued.len() as f64);
        drop(state);
        self.work.notify_one();
    }
}
