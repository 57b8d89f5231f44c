//! Generic batched lookup cache.
//!
//! # Entry lifecycle
//!
//! ```text
//! absent ──get()──► pending ──batch──► resolved ──expiry/purge──► absent
//!                      ▲         └───► failed   ──expiry/purge──► absent
//!                      │                   ▲
//!                      └── transient error ┘ (stays pending until the
//!                                              retry limit, then fails)
//! ```
//!
//! Callers never fetch directly. `get` marks its key pending and waits;
//! whichever caller first finds a batch due starts a cycle, which hands
//! every due key to the [`BatchFetcher`] in one call. Concurrent callers for
//! the same key wait on the same pending entry, so N lookups cost one fetch.
//!
//! Only one cycle runs at a time. Losing the race for the batch lock just
//! means waiting for the running cycle to publish its results.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use labelwatch_core::metrics::{increment_cache, set_gauge};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::expiry::expires_at;

/// Result of fetching one key from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<V> {
    /// The backend returned a value.
    Found(V),
    /// The backend has no value for the key. Cached as a failure.
    NotFound,
    /// The backend rejected the key. Cached as a failure with this reason.
    Failed(String),
    /// Temporary problem (network error, rate limit). The key stays pending
    /// and is retried on a later cycle, up to
    /// [`CacheConfig::max_transient_retries`] times, then cached as a failure.
    Transient(String),
}

/// Backend for a [`BatchedCache`].
///
/// Keys absent from the returned map are treated as [`FetchOutcome::NotFound`].
#[async_trait]
pub trait BatchFetcher<K, V>: Send + Sync {
    async fn fetch_batch(&self, keys: &[K]) -> HashMap<K, FetchOutcome<V>>;
}

/// Error returned by [`BatchedCache::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The lookup did not resolve within the cycle timeout.
    Timeout,
    /// The backend reported a failure for this key.
    Failed {
        reason: String,
        /// Whether this is a cached failure from an earlier lookup.
        cached: bool,
    },
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Failed {
                reason,
                cached: true,
            } => write!(f, "{} (cached)", reason),
            Self::Failed { reason, .. } => f.write_str(reason),
        }
    }
}

impl std::error::Error for LookupError {}

/// Configuration for a [`BatchedCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name used in logs and metric labels.
    pub name: &'static str,

    /// Base lifetime of a resolved entry.
    pub max_age: Duration,

    /// Base lifetime of a cached failure.
    pub failure_max_age: Duration,

    /// Fraction of the base lifetime used as expiry jitter (0.0-1.0).
    pub jitter_fraction: f64,

    /// Entry count above which scavenging evicts entries.
    pub max_size: usize,

    /// Keys per backend call; a cycle starts as soon as this many are pending.
    pub max_batch: usize,

    /// Longest a pending key waits for a full batch before a cycle starts anyway.
    pub batch_wait: Duration,

    /// Bound on both a caller's wait and a single backend cycle.
    pub cycle_timeout: Duration,

    /// Delay before a key that hit a transient backend error is fetched again.
    pub retry_backoff: Duration,

    /// Transient errors tolerated per key before it is cached as failed.
    pub max_transient_retries: u32,

    /// How often waiting callers re-check for a due batch.
    pub poll_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache",
            max_age: Duration::from_secs(3 * 60 * 60),
            failure_max_age: Duration::from_secs(5 * 60),
            jitter_fraction: 0.25,
            max_size: 50_000,
            max_batch: 25,
            batch_wait: Duration::from_millis(100),
            cycle_timeout: Duration::from_secs(180),
            retry_backoff: Duration::from_millis(500),
            max_transient_retries: 2,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Counters since the last [`BatchedCache::take_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    /// Entries dropped by expiry or eviction.
    pub expired: u64,
    pub timeouts: u64,
    pub batches: u64,
    /// Current entry count (not reset).
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate as a percentage, 0 when there were no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            100.0 * self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    expired: AtomicU64,
    timeouts: AtomicU64,
    batches: AtomicU64,
}

enum State<V> {
    Pending {
        since: Instant,
        /// Not fetched again before this instant (transient failures).
        retry_at: Option<Instant>,
        /// Transient failures so far.
        attempts: u32,
        fetching: bool,
    },
    Resolved { value: V, completed_at: i64, expires_at: i64 },
    Failed { reason: String, completed_at: i64, expires_at: i64 },
}

struct Entry<V> {
    state: State<V>,
    last_accessed: Instant,
    use_count: u64,
}

impl<V> Entry<V> {
    fn pending(now: Instant) -> Self {
        Self {
            state: State::Pending {
                since: now,
                retry_at: None,
                attempts: 0,
                fetching: false,
            },
            last_accessed: now,
            use_count: 0,
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        match self.state {
            State::Pending { .. } => false,
            State::Resolved { expires_at, .. } | State::Failed { expires_at, .. } => {
                expires_at <= now_ms
            }
        }
    }

    fn completed_at(&self) -> Option<i64> {
        match self.state {
            State::Pending { .. } => None,
            State::Resolved { completed_at, .. } | State::Failed { completed_at, .. } => {
                Some(completed_at)
            }
        }
    }
}

struct Inner<K, V> {
    config: CacheConfig,
    fetcher: Arc<dyn BatchFetcher<K, V>>,
    entries: Mutex<HashMap<K, Entry<V>>>,
    batch_lock: Arc<tokio::sync::Mutex<()>>,
    /// Bumped after every cycle so waiters re-check their entry.
    cycles: watch::Sender<u64>,
    counters: Counters,
}

/// Batched, coalescing, TTL-bounded lookup cache.
///
/// Cheap to clone; clones share the same entries.
pub struct BatchedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for BatchedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<K, V> BatchedCache<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig, fetcher: Arc<dyn BatchFetcher<K, V>>) -> Self {
        let (cycles, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                entries: Mutex::new(HashMap::new()),
                batch_lock: Arc::new(tokio::sync::Mutex::new(())),
                cycles,
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the key has an entry in any state.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    /// Look up a key, fetching it through the backend if needed.
    ///
    /// Never blocks longer than the cycle timeout.
    pub async fn get(&self, key: &K) -> Result<V, LookupError> {
        let inner = &self.inner;
        let config = &inner.config;
        let deadline = Instant::now() + config.cycle_timeout;
        let mut cycles = inner.cycles.subscribe();
        let mut first_look = true;

        loop {
            if let Some(result) = self.check_entry(key, first_look) {
                return result;
            }
            first_look = false;

            self.try_start_cycle();

            let now = Instant::now();
            if now >= deadline {
                inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                increment_cache("cache_timeouts_total", config.name, 1);
                tracing::debug!("{} lookup timed out for {:?}", config.name, key);
                return Err(LookupError::Timeout);
            }

            let wait = config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cycles.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Inspect the entry for `key`, returning a final result if there is one.
    fn check_entry(&self, key: &K, first_look: bool) -> Option<Result<V, LookupError>> {
        let inner = &self.inner;
        let name = inner.config.name;
        let now = Instant::now();
        let now_ms = now_ms();

        let mut entries = inner.entries.lock();

        if entries.get(key).is_some_and(|e| e.is_expired(now_ms)) {
            entries.remove(key);
            inner.counters.expired.fetch_add(1, Ordering::Relaxed);
        }

        let Some(entry) = entries.get_mut(key) else {
            entries.insert(key.clone(), Entry::pending(now));
            inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            increment_cache("cache_misses_total", name, 1);
            if entries.len() > inner.config.max_size.saturating_mul(2) {
                let removed = scavenge_locked(&mut entries, &inner.config, now_ms);
                self.record_removed(removed, entries.len());
            }
            return None;
        };

        match &entry.state {
            State::Pending { .. } => {
                if first_look {
                    inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    increment_cache("cache_coalesced_total", name, 1);
                }
                None
            }
            State::Resolved { value, .. } => {
                let value = value.clone();
                entry.last_accessed = now;
                entry.use_count += 1;
                if first_look {
                    inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    increment_cache("cache_hits_total", name, 1);
                }
                Some(Ok(value))
            }
            State::Failed { reason, .. } => {
                let reason = reason.clone();
                entry.last_accessed = now;
                entry.use_count += 1;
                if first_look {
                    inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    increment_cache("cache_hits_total", name, 1);
                }
                Some(Err(LookupError::Failed {
                    reason,
                    cached: first_look,
                }))
            }
        }
    }

    /// Start a backend cycle if none is running and some keys are due.
    fn try_start_cycle(&self) {
        let Ok(guard) = self.inner.batch_lock.clone().try_lock_owned() else {
            return;
        };

        let keys = {
            let mut entries = self.inner.entries.lock();
            take_due_keys(&mut entries, &self.inner.config, Instant::now())
        };
        if keys.is_empty() {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_cycle(keys).await;
            drop(guard);
        });
    }

    /// Invalidate a completed entry if it was resolved before `before_ms`.
    ///
    /// Returns whether an entry was dropped. Pending entries are left alone.
    pub fn purge_key(&self, key: &K, before_ms: i64) -> bool {
        let mut entries = self.inner.entries.lock();
        let stale = entries
            .get(key)
            .and_then(Entry::completed_at)
            .is_some_and(|completed| completed < before_ms);
        if stale {
            entries.remove(key);
            tracing::debug!("{} purged {:?} before {}", self.inner.config.name, key, before_ms);
        }
        stale
    }

    /// Drop expired entries and evict down to size.
    ///
    /// Returns the number of entries removed. Also kicks a cycle for any
    /// pending keys left behind by callers that gave up waiting.
    pub fn scavenge(&self) -> usize {
        let (removed, len, has_idle_pending) = {
            let mut entries = self.inner.entries.lock();
            let removed = scavenge_locked(&mut entries, &self.inner.config, now_ms());
            let idle = entries
                .values()
                .any(|e| matches!(e.state, State::Pending { fetching: false, .. }));
            (removed, entries.len(), idle)
        };
        self.record_removed(removed, len);

        if has_idle_pending {
            self.try_start_cycle();
        }
        removed
    }

    fn record_removed(&self, removed: usize, len: usize) {
        if removed > 0 {
            self.inner
                .counters
                .expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            increment_cache("cache_evicted_total", self.inner.config.name, removed as u64);
        }
        metrics::gauge!("cache_entries", "cache" => self.inner.config.name).set(len as f64);
    }

    /// Counters since the previous call, which are reset.
    pub fn take_stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.swap(0, Ordering::Relaxed),
            misses: c.misses.swap(0, Ordering::Relaxed),
            coalesced: c.coalesced.swap(0, Ordering::Relaxed),
            expired: c.expired.swap(0, Ordering::Relaxed),
            timeouts: c.timeouts.swap(0, Ordering::Relaxed),
            batches: c.batches.swap(0, Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn run_cycle(&self, keys: Vec<K>) {
        let name = self.config.name;
        let started = Instant::now();
        tracing::trace!("{} fetching batch of {}", name, keys.len());

        let mut results =
            match tokio::time::timeout(self.config.cycle_timeout, self.fetcher.fetch_batch(&keys))
                .await
            {
                Ok(results) => Some(results),
                Err(_) => {
                    tracing::warn!(
                        "{} batch of {} keys timed out after {:?}",
                        name,
                        keys.len(),
                        self.config.cycle_timeout
                    );
                    None
                }
            };

        let now = Instant::now();
        let completed_at = now_ms();
        {
            let mut entries = self.entries.lock();
            for key in keys {
                let outcome = match results.as_mut() {
                    Some(results) => results.remove(&key).unwrap_or(FetchOutcome::NotFound),
                    None => FetchOutcome::Transient("timeout".to_string()),
                };
                let Some(entry) = entries.get_mut(&key) else {
                    continue;
                };
                let attempts = match entry.state {
                    State::Pending { attempts, .. } => attempts + 1,
                    _ => 1,
                };
                entry.state = match outcome {
                    FetchOutcome::Found(value) => State::Resolved {
                        value,
                        completed_at,
                        expires_at: expires_at(
                            completed_at,
                            self.config.max_age,
                            self.config.jitter_fraction,
                        ),
                    },
                    FetchOutcome::NotFound => self.failed("not found".to_string(), completed_at),
                    FetchOutcome::Failed(reason) => self.failed(reason, completed_at),
                    FetchOutcome::Transient(reason)
                        if attempts > self.config.max_transient_retries =>
                    {
                        tracing::debug!(
                            "{} giving up on {:?} after {} attempts: {}",
                            name,
                            key,
                            attempts,
                            reason
                        );
                        self.failed(reason, completed_at)
                    }
                    FetchOutcome::Transient(reason) => {
                        tracing::debug!("{} will retry {:?}: {}", name, key, reason);
                        State::Pending {
                            since: now,
                            retry_at: Some(now + self.config.retry_backoff),
                            attempts,
                            fetching: false,
                        }
                    }
                };
            }
        }

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        increment_cache("cache_batches_total", name, 1);
        metrics::histogram!("cache_batch_duration_seconds", "cache" => name)
            .record(started.elapsed().as_secs_f64());

        self.cycles.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn failed(&self, reason: String, completed_at: i64) -> State<V> {
        State::Failed {
            reason,
            completed_at,
            expires_at: expires_at(
                completed_at,
                self.config.failure_max_age,
                self.config.jitter_fraction,
            ),
        }
    }
}

/// Pick the pending keys a cycle should fetch now and mark them in flight.
///
/// At most `max_batch` keys, oldest first. A partial batch is only taken once
/// its oldest key has waited `batch_wait`.
fn take_due_keys<K, V>(entries: &mut HashMap<K, Entry<V>>, config: &CacheConfig, now: Instant) -> Vec<K>
where
    K: Clone + Eq + Hash,
{
    let mut idle: Vec<(Instant, &K)> = entries
        .iter()
        .filter_map(|(k, e)| match e.state {
            State::Pending {
                since,
                retry_at,
                fetching: false,
                ..
            } if retry_at.map_or(true, |at| at <= now) => Some((since, k)),
            _ => None,
        })
        .collect();
    if idle.is_empty() {
        return Vec::new();
    }
    idle.sort_by_key(|(since, _)| *since);

    let max_batch = config.max_batch.max(1);
    let waited_out = now.duration_since(idle[0].0) >= config.batch_wait;
    if idle.len() < max_batch && !waited_out {
        return Vec::new();
    }
    let take = idle.len().min(max_batch);

    let keys: Vec<K> = idle.into_iter().take(take).map(|(_, k)| k.clone()).collect();
    for key in &keys {
        if let Some(Entry {
            state: State::Pending { fetching, .. },
            ..
        }) = entries.get_mut(key)
        {
            *fetching = true;
        }
    }
    keys
}

/// Remove expired entries, then evict completed entries down to 75% of
/// `max_size` if still over it.
///
/// Completed means resolved or failed: a cached failure is as cheap to
/// rebuild as a value. Pending entries are never removed.
fn scavenge_locked<K, V>(entries: &mut HashMap<K, Entry<V>>, config: &CacheConfig, now_ms: i64) -> usize
where
    K: Clone + Eq + Hash,
{
    let before = entries.len();
    entries.retain(|_, e| !e.is_expired(now_ms));

    if entries.len() > config.max_size {
        let target = config.max_size * 3 / 4;
        let mut candidates: Vec<(Instant, u64, K)> = entries
            .iter()
            .filter(|(_, e)| !matches!(e.state, State::Pending { .. }))
            .map(|(k, e)| (e.last_accessed, e.use_count, k.clone()))
            .collect();
        candidates.sort_by_key(|(accessed, uses, _)| (*accessed, *uses));

        let excess = entries.len().saturating_sub(target);
        for (_, _, key) in candidates.into_iter().take(excess) {
            entries.remove(&key);
        }
    }

    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Returns `value-<key>` for every key, counting calls per key.
    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        per_key: Mutex<HashMap<u32, usize>>,
        batch_sizes: Mutex<Vec<usize>>,
        missing: Vec<u32>,
        gate: Option<Arc<Notify>>,
    }

    impl CountingFetcher {
        fn calls_for(&self, key: u32) -> usize {
            self.per_key.lock().get(&key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl BatchFetcher<u32, String> for CountingFetcher {
        async fn fetch_batch(&self, keys: &[u32]) -> HashMap<u32, FetchOutcome<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().push(keys.len());
            {
                let mut per_key = self.per_key.lock();
                for k in keys {
                    *per_key.entry(*k).or_default() += 1;
                }
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            keys.iter()
                .filter(|k| !self.missing.contains(k))
                .map(|k| (*k, FetchOutcome::Found(format!("value-{k}"))))
                .collect()
        }
    }

    fn test_config() -> CacheConfig {
        CacheConfig {
            name: "test",
            max_age: Duration::from_secs(60),
            failure_max_age: Duration::from_secs(60),
            jitter_fraction: 0.0,
            max_size: 1000,
            max_batch: 25,
            batch_wait: Duration::from_millis(5),
            cycle_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(5),
            max_transient_retries: 2,
            poll_interval: Duration::from_millis(2),
        }
    }

    fn cache_with(fetcher: Arc<CountingFetcher>, config: CacheConfig) -> BatchedCache<u32, String> {
        BatchedCache::new(config, fetcher)
    }

    // =========================================================================
    // Lookup states
    // =========================================================================

    #[tokio::test]
    async fn test_miss_then_hit() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = cache_with(fetcher.clone(), test_config());

        assert_eq!(cache.get(&1).await.unwrap(), "value-1");
        assert_eq!(cache.get(&1).await.unwrap(), "value-1");

        assert_eq!(fetcher.calls_for(1), 1);
        let stats = cache.take_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hit_rate(), 50.0);

        // Counters reset on read.
        let stats = cache.take_stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_cached_as_failure() {
        let fetcher = Arc::new(CountingFetcher {
            missing: vec![9],
            ..Default::default()
        });
        let cache = cache_with(fetcher.clone(), test_config());

        let first = cache.get(&9).await.unwrap_err();
        assert_eq!(
            first,
            LookupError::Failed {
                reason: "not found".to_string(),
                cached: false
            }
        );
        let second = cache.get(&9).await.unwrap_err();
        assert_eq!(second.to_string(), "not found (cached)");
        assert_eq!(fetcher.calls_for(9), 1);
        assert_eq!(cache.take_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CacheConfig {
            max_age: Duration::from_millis(30),
            ..test_config()
        };
        let cache = cache_with(fetcher.clone(), config);

        cache.get(&1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.get(&1).await.unwrap();

        assert_eq!(fetcher.calls_for(1), 2);
        let stats = cache.take_stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.expired, 1);
    }

    // =========================================================================
    // Coalescing and batching
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_gets_coalesce_into_one_fetch() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(CountingFetcher {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let cache = cache_with(fetcher.clone(), test_config());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(&7).await })
            })
            .collect();

        // Let the cycle start and park on the gate, then release it.
        while fetcher.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "value-7");
        }
        assert_eq!(fetcher.calls_for(7), 1);

        let stats = cache.take_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 9);
    }

    #[tokio::test]
    async fn test_distinct_keys_share_a_batch() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CacheConfig {
            batch_wait: Duration::from_millis(50),
            ..test_config()
        };
        let cache = cache_with(fetcher.clone(), config);

        let handles: Vec<_> = (0..10)
            .map(|k| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(&k).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.batch_sizes.lock().as_slice(), &[10]);
    }

    #[tokio::test]
    async fn test_full_batches_do_not_wait() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CacheConfig {
            max_batch: 4,
            batch_wait: Duration::from_secs(30),
            ..test_config()
        };
        let cache = cache_with(fetcher.clone(), config);

        let handles: Vec<_> = (0..8)
            .map(|k| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(&k).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sizes = fetcher.batch_sizes.lock().clone();
        assert_eq!(sizes.iter().sum::<usize>(), 8);
        assert!(sizes.iter().all(|s| s % 4 == 0));
    }

    #[test]
    fn test_take_due_keys_caps_waited_out_burst() {
        let config = CacheConfig {
            max_batch: 4,
            batch_wait: Duration::from_millis(100),
            ..test_config()
        };
        let now = Instant::now();
        let mut entries: HashMap<u32, Entry<String>> = HashMap::new();
        for k in 0..10 {
            entries.insert(k, Entry::pending(now));
        }

        let later = now + Duration::from_millis(150);
        let sizes: Vec<usize> = (0..4)
            .map(|_| take_due_keys(&mut entries, &config, later).len())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2, 0]);
    }

    #[tokio::test]
    async fn test_burst_is_split_into_bounded_batches() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CacheConfig {
            max_batch: 4,
            batch_wait: Duration::from_millis(20),
            ..test_config()
        };
        let cache = cache_with(fetcher.clone(), config);

        let handles: Vec<_> = (0..11)
            .map(|k| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(&k).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sizes = fetcher.batch_sizes.lock().clone();
        assert_eq!(sizes.iter().sum::<usize>(), 11);
        assert!(sizes.iter().all(|s| *s <= 4), "sizes {sizes:?}");
    }

    #[test]
    fn test_take_due_keys_rules() {
        let config = CacheConfig {
            max_batch: 3,
            batch_wait: Duration::from_millis(100),
            ..test_config()
        };
        let now = Instant::now();
        let mut entries: HashMap<u32, Entry<String>> = HashMap::new();
        for k in 0..7 {
            entries.insert(k, Entry::pending(now));
        }

        // Seven fresh keys: full batches of three, one per cycle.
        assert_eq!(take_due_keys(&mut entries, &config, now).len(), 3);
        assert_eq!(take_due_keys(&mut entries, &config, now).len(), 3);
        // One left idle, not yet waited out.
        assert!(take_due_keys(&mut entries, &config, now).is_empty());
        // Once it waited long enough it goes alone.
        let later = now + Duration::from_millis(150);
        assert_eq!(take_due_keys(&mut entries, &config, later).len(), 1);
        // Everything is in flight now.
        assert!(take_due_keys(&mut entries, &config, later).is_empty());
    }

    // =========================================================================
    // Failures and timeouts
    // =========================================================================

    /// Hangs on the first call, answers afterwards.
    struct HangOnceFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchFetcher<u32, String> for HangOnceFetcher {
        async fn fetch_batch(&self, keys: &[u32]) -> HashMap<u32, FetchOutcome<String>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            keys.iter()
                .map(|k| (*k, FetchOutcome::Found("late".to_string())))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_timeout_does_not_poison_entry() {
        let fetcher = Arc::new(HangOnceFetcher {
            calls: AtomicUsize::new(0),
        });
        let config = CacheConfig {
            cycle_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let cache: BatchedCache<u32, String> = BatchedCache::new(config, fetcher.clone());

        assert_eq!(cache.get(&1).await, Err(LookupError::Timeout));
        assert_eq!(cache.take_stats().timeouts, 1);

        assert_eq!(cache.get(&1).await.unwrap(), "late");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    /// Reports a transient error on the first call.
    struct FlakyFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchFetcher<u32, String> for FlakyFetcher {
        async fn fetch_batch(&self, keys: &[u32]) -> HashMap<u32, FetchOutcome<String>> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            keys.iter()
                .map(|k| {
                    let outcome = if first {
                        FetchOutcome::Transient("connection reset".to_string())
                    } else {
                        FetchOutcome::Found("ok".to_string())
                    };
                    (*k, outcome)
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_transient_error_retries_on_next_cycle() {
        let fetcher = Arc::new(FlakyFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache: BatchedCache<u32, String> = BatchedCache::new(test_config(), fetcher.clone());

        assert_eq!(cache.get(&3).await.unwrap(), "ok");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    /// Always reports a transient error.
    struct DownFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchFetcher<u32, String> for DownFetcher {
        async fn fetch_batch(&self, keys: &[u32]) -> HashMap<u32, FetchOutcome<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            keys.iter()
                .map(|k| (*k, FetchOutcome::Transient("status 503".to_string())))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_persistent_transient_error_becomes_cached_failure() {
        let fetcher = Arc::new(DownFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache: BatchedCache<u32, String> = BatchedCache::new(test_config(), fetcher.clone());

        assert_eq!(
            cache.get(&4).await,
            Err(LookupError::Failed {
                reason: "status 503".to_string(),
                cached: false
            })
        );
        // First attempt plus two retries.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.take_stats().timeouts, 0);

        // Cached until the failure expires; no further upstream calls.
        assert_eq!(cache.get(&4).await.unwrap_err().to_string(), "status 503 (cached)");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    // =========================================================================
    // Purge and eviction
    // =========================================================================

    #[tokio::test]
    async fn test_purge_key() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = cache_with(fetcher.clone(), test_config());

        assert!(!cache.purge_key(&1, now_ms()));
        cache.get(&1).await.unwrap();

        // Resolved after this cutoff: keep.
        assert!(!cache.purge_key(&1, now_ms() - 60_000));
        assert!(cache.contains(&1));

        assert!(cache.purge_key(&1, now_ms() + 1000));
        assert!(!cache.contains(&1));

        cache.get(&1).await.unwrap();
        assert_eq!(fetcher.calls_for(1), 2);
    }

    #[tokio::test]
    async fn test_scavenge_bounds_size() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CacheConfig {
            max_size: 100,
            max_batch: 100,
            ..test_config()
        };
        let cache = cache_with(fetcher.clone(), config);

        for chunk in (0..1100u32).collect::<Vec<_>>().chunks(100) {
            let handles: Vec<_> = chunk
                .iter()
                .map(|k| {
                    let cache = cache.clone();
                    let k = *k;
                    tokio::spawn(async move { cache.get(&k).await })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        }

        cache.scavenge();
        assert!(cache.len() <= 100, "len {}", cache.len());
        assert!(cache.take_stats().expired >= 1000);
    }

    #[tokio::test]
    async fn test_scavenge_prefers_cold_entries() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CacheConfig {
            max_size: 10,
            max_batch: 1,
            ..test_config()
        };
        let cache = cache_with(fetcher.clone(), config);

        for k in 0..20 {
            cache.get(&k).await.unwrap();
        }
        for k in 0..5 {
            cache.get(&k).await.unwrap();
        }

        cache.scavenge();
        assert!(cache.len() <= 10);
        for k in 0..5 {
            assert!(cache.contains(&k), "hot key {k} was evicted");
        }
    }

    #[test]
    fn test_scavenge_evicts_cached_failures_but_not_pending() {
        let config = CacheConfig {
            max_size: 4,
            ..test_config()
        };
        let now = Instant::now();
        let now_ms = now_ms();
        let mut entries: HashMap<u32, Entry<String>> = HashMap::new();
        for k in 0..4 {
            entries.insert(k, Entry::pending(now));
        }
        for k in 4..8 {
            entries.insert(
                k,
                Entry {
                    state: State::Failed {
                        reason: "not found".to_string(),
                        completed_at: now_ms,
                        expires_at: now_ms + 60_000,
                    },
                    last_accessed: now,
                    use_count: 0,
                },
            );
        }

        // Target is 3; only the four failures are candidates.
        assert_eq!(scavenge_locked(&mut entries, &config, now_ms), 4);
        assert_eq!(entries.len(), 4);
        assert!((0..4).all(|k| entries.contains_key(&k)));
    }

    #[tokio::test]
    async fn test_scavenge_never_evicts_in_flight() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(CountingFetcher {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let config = CacheConfig {
            max_size: 4,
            max_batch: 100,
            ..test_config()
        };
        let cache = cache_with(fetcher.clone(), config);

        let handles: Vec<_> = (0..10)
            .map(|k| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(&k).await })
            })
            .collect();
        while fetcher.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        cache.scavenge();
        assert_eq!(cache.len(), 10);

        gate.notify_one();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        cache.scavenge();
        assert!(cache.len() <= 4);
    }
}
