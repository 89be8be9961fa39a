//! Retry with exponential backoff, jitter, and an elapsed-time budget.
//!
//! Only transient errors (as classified by `Error::is_transient`) are
//! retried. The elapsed budget is checked *before* sleeping, so a retry
//! never starts a sleep it cannot afford.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use agentmesh_core::error::{Error, ResilienceError, Result};

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first (must be ≥ 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Backoff multiplier applied after each failed attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Cap on any single backoff interval
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Total wall-clock budget across all attempts and sleeps
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,

    /// Randomize each sleep into [interval/2, interval]
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_interval_ms() -> u64 {
    100
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_interval_ms() -> u64 {
    30_000
}
fn default_max_elapsed_ms() -> u64 {
    60_000
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Retries a unit of work according to a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `work` until it succeeds, fails permanently, or the attempt /
    /// elapsed budget runs out. The closure receives the 1-based attempt
    /// number.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, mut work: F) -> Result<T>
    where
        T: Send,
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let started = Instant::now();
        let mut interval = Duration::from_millis(self.config.initial_interval_ms);
        let budget = Duration::from_millis(self.config.max_elapsed_ms);

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled.into());
            }

            let err = match work(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt == self.config.max_attempts {
                return Err(err);
            }

            // Budget is checked before sleeping, not after.
            let delay = self.delay_for(interval);
            if started.elapsed() + delay >= budget {
                debug!(attempt, "Retry budget exhausted");
                return Err(err);
            }

            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying after failure");

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::from(ResilienceError::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }

            interval = interval
                .mul_f64(self.config.multiplier)
                .min(Duration::from_millis(self.config.max_interval_ms));
        }

        unreachable!("retry loop returns on last attempt")
    }

    fn delay_for(&self, interval: Duration) -> Duration {
        if !self.config.jitter {
            return interval;
        }
        let factor = rand::rng().random_range(0.5..=1.0);
        interval.mul_f64(factor)
    }
}
