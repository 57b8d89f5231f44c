//! Labeler configuration.
//!
//! [`LabelerConfig`] holds credentials and service endpoints loaded from the
//! environment. [`Limits`] holds the operational constants (concurrency,
//! timeouts, cache sizes, rate limits) and builds the per-component configs
//! from them.

use std::fmt;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::firehose::FirehoseConfig;
use crate::queue::QueueConfig;
use crate::rules::FeedRuleConfig;
use crate::store::PendingConfig;
use crate::upstream::RateLimitConfig;
use crate::{Error, Result};

pub const DEFAULT_LABELER_SERVICE: &str = "https://bsky.social";
pub const DEFAULT_PUBLIC_SERVICE: &str = "https://api.bsky.app";
pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";
pub const DEFAULT_FIREHOSE_SERVICE: &str = "wss://bsky.network";

/// Fourteen days.
pub const DEFAULT_NEWHANDLE_EXPIRY_SECS: u64 = 1_209_600;

/// Credentials and endpoints.
#[derive(Clone)]
pub struct LabelerConfig {
    /// Labeler account DID; learned from the login session when unset.
    pub labeler_did: Option<String>,
    pub handle: String,
    pub password: String,
    /// PDS hosting the labeler account (sessions and moderation events).
    pub labeler_service: String,
    /// App view for profiles, posts, and author feeds.
    pub public_service: String,
    pub plc_directory: String,
    pub firehose_service: String,
    /// How long `newaccount` and `newhandle` labels apply.
    pub newhandle_expiry: Duration,
}

impl fmt::Debug for LabelerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelerConfig")
            .field("labeler_did", &self.labeler_did)
            .field("handle", &self.handle)
            .field("password", &"<redacted>")
            .field("labeler_service", &self.labeler_service)
            .field("public_service", &self.public_service)
            .field("plc_directory", &self.plc_directory)
            .field("firehose_service", &self.firehose_service)
            .field("newhandle_expiry", &self.newhandle_expiry)
            .finish()
    }
}

impl LabelerConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `LABELER_HANDLE`: Labeler account handle
    /// - `LABELER_PASSWORD`: Labeler account (app) password
    ///
    /// Optional:
    /// - `LABELER_DID`: Labeler DID (default: from the login session)
    /// - `LABELER_SERVICE`: Labeler PDS (default: "https://bsky.social")
    /// - `PUBLIC_SERVICE`: App view (default: "https://api.bsky.app")
    /// - `PLC_DIRECTORY`: PLC directory (default: "https://plc.directory")
    /// - `FIREHOSE_SERVICE`: Relay (default: "wss://bsky.network")
    /// - `NEWHANDLE_EXPIRY_SECS`: Watch window in seconds (default: 1209600)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let url = |key: &str, default: &str| {
            var(key)
                .unwrap_or_else(|| default.to_string())
                .trim_end_matches('/')
                .to_string()
        };
        let required = |key: &str| var(key).ok_or_else(|| Error::Config(format!("{} is not set", key)));

        let newhandle_expiry = match var("NEWHANDLE_EXPIRY_SECS") {
            Some(value) => value.parse::<u64>().map_err(|_| {
                Error::Config(format!("NEWHANDLE_EXPIRY_SECS is not a number: {}", value))
            })?,
            None => DEFAULT_NEWHANDLE_EXPIRY_SECS,
        };

        let config = Self {
            labeler_did: var("LABELER_DID"),
            handle: required("LABELER_HANDLE")?,
            password: required("LABELER_PASSWORD")?,
            labeler_service: url("LABELER_SERVICE", DEFAULT_LABELER_SERVICE),
            public_service: url("PUBLIC_SERVICE", DEFAULT_PUBLIC_SERVICE),
            plc_directory: url("PLC_DIRECTORY", DEFAULT_PLC_DIRECTORY),
            firehose_service: url("FIREHOSE_SERVICE", DEFAULT_FIREHOSE_SERVICE),
            newhandle_expiry: Duration::from_secs(newhandle_expiry),
        };

        if let Some(did) = &config.labeler_did {
            labelwatch_core::validate_did(did)?;
        }

        tracing::info!(
            handle = %config.handle,
            labeler_did = config.labeler_did.as_deref().unwrap_or("<from session>"),
            labeler_service = %config.labeler_service,
            public_service = %config.public_service,
            firehose_service = %config.firehose_service,
            "labeler configuration loaded"
        );

        Ok(config)
    }
}

/// Operational limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Commit tasks running at once.
    pub max_concurrent_commits: usize,
    /// Time budget of one commit attempt.
    pub max_processing_time: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,

    /// Silence after which the firehose counts as stalled.
    pub max_firehose_delay: Duration,
    /// Raw frames buffered ahead of decoding.
    pub max_pending_frames: usize,
    /// First reconnect delay; doubles up to `max_reconnect_delay`.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,

    /// How often the checkpoint is persisted.
    pub checkpoint_interval: Duration,
    pub max_pending_inserts: usize,
    pub max_pending_wait: Duration,

    pub feed_limit: usize,
    pub rapid_post_stdev: Duration,

    pub cache_max_age: Duration,
    pub failure_max_age: Duration,
    pub profile_cache_size: usize,
    pub feed_cache_size: usize,
    pub plc_cache_size: usize,
    pub post_cache_size: usize,
    /// Longest a lookup waits for its batch to fill.
    pub min_batch_wait: Duration,
    /// Bound on one lookup cycle.
    pub batch_cycle_timeout: Duration,

    pub auth_rate: RateLimitConfig,
    pub pds_rate: RateLimitConfig,
    pub plc_rate: RateLimitConfig,
    pub public_rate: RateLimitConfig,
    pub request_timeout: Duration,

    pub emit_interval: Duration,
    pub emit_batch: usize,
    pub stats_interval: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_concurrent_commits: 256,
            max_processing_time: Duration::from_secs(2 * 60),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),

            max_firehose_delay: Duration::from_secs(3 * 60),
            max_pending_frames: 5000,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),

            checkpoint_interval: Duration::from_secs(15 * 60),
            max_pending_inserts: 64,
            max_pending_wait: Duration::from_secs(30),

            feed_limit: 30,
            rapid_post_stdev: Duration::from_secs(12),

            cache_max_age: Duration::from_secs(3 * 60 * 60),
            failure_max_age: Duration::from_secs(5 * 60),
            profile_cache_size: 50_000,
            feed_cache_size: 50_000,
            plc_cache_size: 50_000,
            post_cache_size: 500,
            min_batch_wait: Duration::from_millis(100),
            batch_cycle_timeout: Duration::from_secs(3 * 60),

            // Session creation is tightly limited by the PDS.
            auth_rate: RateLimitConfig {
                name: "auth",
                max_concurrent: 1,
                max_rate: Some(8),
                interval: Duration::from_secs(40 * 60),
                max_delay: Some(Duration::from_secs(40 * 60 + 20)),
            },
            pds_rate: RateLimitConfig {
                name: "pds",
                max_concurrent: 128,
                max_rate: Some(2750),
                interval: Duration::from_secs(5 * 60),
                max_delay: None,
            },
            plc_rate: RateLimitConfig::concurrent("plc", 256),
            public_rate: RateLimitConfig::concurrent("public", 48),
            request_timeout: Duration::from_secs(30),

            emit_interval: Duration::from_secs(1),
            emit_batch: 1000,
            stats_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl Limits {
    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_interval <= self.max_processing_time {
            return Err(Error::Config(format!(
                "checkpoint interval ({:?}) must exceed the maximum processing time ({:?})",
                self.checkpoint_interval, self.max_processing_time
            )));
        }
        if self.max_concurrent_commits == 0 {
            return Err(Error::Config("max concurrent commits must be positive".to_string()));
        }
        if self.max_pending_inserts == 0 || self.emit_batch == 0 {
            return Err(Error::Config("insert and emit batch sizes must be positive".to_string()));
        }
        if self.batch_cycle_timeout <= self.min_batch_wait {
            return Err(Error::Config(format!(
                "batch cycle timeout ({:?}) must exceed the batch wait ({:?})",
                self.batch_cycle_timeout, self.min_batch_wait
            )));
        }
        if self.feed_limit < 3 {
            return Err(Error::Config(format!("feed limit {} is below 3", self.feed_limit)));
        }
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(Error::Config("max reconnect delay is below the reconnect delay".to_string()));
        }
        Ok(())
    }

    pub fn cache(&self, name: &'static str, max_size: usize) -> CacheConfig {
        CacheConfig {
            name,
            max_age: self.cache_max_age,
            failure_max_age: self.failure_max_age,
            max_size,
            batch_wait: self.min_batch_wait,
            cycle_timeout: self.batch_cycle_timeout,
            retry_backoff: self.retry_backoff,
            ..CacheConfig::default()
        }
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            max_concurrency: self.max_concurrent_commits,
            max_processing_time: self.max_processing_time,
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff,
            ..QueueConfig::default()
        }
    }

    pub fn firehose(&self) -> FirehoseConfig {
        FirehoseConfig {
            timeout: self.max_firehose_delay,
            max_pending: self.max_pending_frames,
            ..FirehoseConfig::default()
        }
    }

    pub fn pending(&self) -> PendingConfig {
        PendingConfig {
            max_pending: self.max_pending_inserts,
            max_wait: self.max_pending_wait,
        }
    }

    pub fn feed_rules(&self) -> FeedRuleConfig {
        FeedRuleConfig {
            feed_limit: self.feed_limit,
            rapid_post_stdev_ms: self.rapid_post_stdev.as_millis() as f64,
        }
    }
}
