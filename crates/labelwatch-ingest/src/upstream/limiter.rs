//! Rate limiting for upstream API calls.
//!
//! Each upstream (public API, authenticated PDS, PLC directory) gets its own
//! [`RateLimiter`] combining three limits:
//! - a concurrency cap (semaphore permits held for the call's duration)
//! - a sliding window of at most `rate` call starts per `interval`
//! - an optional maximum queueing delay, past which the call is refused

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::{Error, Result};

/// Configuration for a [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Name used in errors and logs.
    pub name: &'static str,

    /// Maximum calls in flight.
    pub max_concurrent: usize,

    /// Maximum call starts per `interval`. `None` disables the window.
    pub max_rate: Option<usize>,

    /// Window length for `max_rate`.
    pub interval: Duration,

    /// Longest a call may wait for a slot. `None` waits indefinitely.
    pub max_delay: Option<Duration>,
}

impl RateLimitConfig {
    pub fn concurrent(name: &'static str, max_concurrent: usize) -> Self {
        Self {
            name,
            max_concurrent,
            max_rate: None,
            interval: Duration::from_secs(300),
            max_delay: None,
        }
    }
}

/// Concurrency + sliding-window limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    permits: Arc<Semaphore>,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            permits,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Wait for a slot. The returned permit must be held for the call.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let deadline = self.config.max_delay.map(|d| Instant::now() + d);

        let acquire = self.permits.clone().acquire_owned();
        let permit = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, acquire)
                .await
                .map_err(|_| self.refused())?,
            None => acquire.await,
        }
        .map_err(|_| Error::RateLimited(format!("{} limiter closed", self.config.name)))?;

        let Some(rate) = self.config.max_rate else {
            return Ok(permit);
        };

        loop {
            let wait_until = {
                let now = Instant::now();
                let mut starts = self.starts.lock();
                while starts
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.config.interval)
                {
                    starts.pop_front();
                }
                if starts.len() < rate {
                    starts.push_back(now);
                    return Ok(permit);
                }
                match starts.front() {
                    Some(oldest) => *oldest + self.config.interval,
                    None => now,
                }
            };

            if deadline.is_some_and(|d| wait_until > d) {
                return Err(self.refused());
            }
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// Run `call` under the limiter.
    pub async fn run<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(call.await)
    }

    fn refused(&self) -> Error {
        Error::RateLimited(format!(
            "{}: no slot within {:?}",
            self.config.name,
            self.config.max_delay.unwrap_or_default()
        ))
    }
}
