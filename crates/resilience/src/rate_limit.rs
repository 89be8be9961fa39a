//! Token-bucket rate limiter.
//!
//! `allow()` is non-blocking; `wait()` blocks up to a limit and then fails
//! with `RateLimited`. The refill rate can be adjusted at runtime from
//! observed upstream `RateLimit-*` headers.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use agentmesh_core::error::{ResilienceError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Longest a `wait()` may block
    #[serde(default = "default_wait_limit_ms")]
    pub wait_limit_ms: u64,
}

fn default_rate() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    20
}
fn default_wait_limit_ms() -> u64 {
    5_000
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            burst: default_burst(),
            wait_limit_ms: default_wait_limit_ms(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Time until one full token is available, assuming no contention.
    fn time_to_token(&self) -> Duration {
        if self.tokens >= 1.0 || self.rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
    }
}

/// A token bucket starting full at `burst` capacity.
#[derive(Debug)]
pub struct TokenBucket {
    inner: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            inner: Mutex::new(Bucket {
                tokens: f64::from(burst),
                rate,
                burst: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimiterConfig) -> Self {
        Self::new(config.rate, config.burst)
    }

    /// Take one token if available. Non-blocking.
    pub fn allow(&self) -> bool {
        let mut bucket = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available, up to `limit`.
    pub async fn wait(&self, limit: Duration, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + limit;

        loop {
            let sleep_for = {
                let mut bucket = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                bucket.refill();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                bucket.time_to_token()
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(ResilienceError::RateLimited {
                    waited_ms: limit.as_millis() as u64,
                }
                .into());
            }

            let sleep_for = sleep_for.min(deadline - now).max(Duration::from_millis(1));
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled.into()),
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Adjust the refill rate (tokens/sec), e.g. from upstream
    /// `RateLimit-Remaining` / `RateLimit-Reset` observations.
    pub fn set_rate(&self, rate: f64) {
        let mut bucket = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill();
        debug!(old = bucket.rate, new = rate, "Rate limiter adjusted");
        bucket.rate = rate.max(0.0);
    }

    /// Currently available tokens (after refill). Mostly for tests.
    pub fn available(&self) -> f64 {
        let mut bucket = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill();
        bucket.tokens
    }
}
