//! Circuit breaker with interval-windowed failure counting.
//!
//! Closed → Open when, over one interval window, at least `minimum_sample`
//! requests completed and the failure ratio reached `failure_ratio`.
//! Open → Half-Open after `open_timeout_ms`. Half-Open admits at most
//! `max_requests` trial calls; any failure reopens (timer resets), a full
//! set of successes closes.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use agentmesh_core::error::{ResilienceError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Trial calls admitted while half-open
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Length of one failure-counting window
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// How long the breaker stays open before probing
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Failures / requests ratio that trips the breaker
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,

    /// Minimum completed requests in the window before the ratio applies
    #[serde(default = "default_minimum_sample")]
    pub minimum_sample: u32,
}

fn default_max_requests() -> u32 {
    1
}
fn default_interval_ms() -> u64 {
    60_000
}
fn default_open_timeout_ms() -> u64 {
    60_000
}
fn default_failure_ratio() -> f64 {
    0.5
}
fn default_minimum_sample() -> u32 {
    5
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            interval_ms: default_interval_ms(),
            open_timeout_ms: default_open_timeout_ms(),
            failure_ratio: default_failure_ratio(),
            minimum_sample: default_minimum_sample(),
        }
    }
}

/// Breaker state, observable for tests and health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    window_started: Instant,
    requests: u32,
    failures: u32,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
    half_open_successes: u32,
}

/// A circuit breaker wrapping one downstream.
///
/// State lives behind a `std::sync::Mutex` held only for bookkeeping, never
/// across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window_started: Instant::now(),
                requests: 0,
                failures: 0,
                opened_at: None,
                half_open_inflight: 0,
                half_open_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_probe(&mut inner);
        inner.state
    }

    /// Run `work` through the breaker. Fails fast with `CircuitOpen` while
    /// open or while half-open trials are saturated.
    pub async fn call<T, F, Fut>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.admit()?;
        let result = work().await;
        self.record(result.is_ok());
        result
    }

    /// Admission check; transitions Open → Half-Open when the timer expires.
    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_probe(&mut inner);

        match inner.state {
            BreakerState::Closed => {
                self.roll_window(&mut inner);
                Ok(())
            }
            BreakerState::Open => Err(ResilienceError::CircuitOpen {
                failures: inner.failures,
            }
            .into()),
            BreakerState::HalfOpen => {
                if inner.half_open_inflight >= self.config.max_requests {
                    return Err(ResilienceError::CircuitOpen {
                        failures: inner.failures,
                    }
                    .into());
                }
                inner.half_open_inflight += 1;
                Ok(())
            }
        }
    }

    /// Record a completed call and apply state transitions.
    fn record(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.state {
            BreakerState::Closed => {
                self.roll_window(&mut inner);
                inner.requests += 1;
                if !success {
                    inner.failures += 1;
                }

                if inner.requests >= self.config.minimum_sample {
                    let ratio = f64::from(inner.failures) / f64::from(inner.requests);
                    if ratio >= self.config.failure_ratio {
                        warn!(
                            failures = inner.failures,
                            requests = inner.requests,
                            "Circuit breaker tripped — opening"
                        );
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.max_requests {
                        info!("Circuit breaker recovered — closing");
                        inner.state = BreakerState::Closed;
                        inner.window_started = Instant::now();
                        inner.requests = 0;
                        inner.failures = 0;
                        inner.opened_at = None;
                    }
                } else {
                    warn!("Half-open trial failed — reopening");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            // A call admitted before the trip completes afterwards; its
            // outcome no longer changes the open state.
            BreakerState::Open => {}
        }
    }

    /// Open → Half-Open once the open timeout has elapsed.
    fn maybe_probe(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let timeout = Duration::from_millis(self.config.open_timeout_ms);
        if inner.opened_at.is_some_and(|at| at.elapsed() >= timeout) {
            info!("Circuit breaker → half-open");
            inner.state = BreakerState::HalfOpen;
            inner.half_open_inflight = 0;
            inner.half_open_successes = 0;
        }
    }

    /// Reset the counting window when the interval has passed.
    fn roll_window(&self, inner: &mut Inner) {
        let interval = Duration::from_millis(self.config.interval_ms);
        if inner.window_started.elapsed() >= interval {
            inner.window_started = Instant::now();
            inner.requests = 0;
            inner.failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_core::error::{AdapterError, Error};

    fn upstream_503() -> Error {
        AdapterError::Upstream {
            adapter: "test".into(),
            status: 503,
            message: "unavailable".into(),
            operation: None,
            resource: None,
            rate_limit: None,
        }
        .into()
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            max_requests: 1,
            interval_ms: 60_000,
            open_timeout_ms: 60_000,
            failure_ratio: 0.5,
            minimum_sample: 5,
        })
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Err(upstream_503()) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_minimum_sample_at_ratio() {
        let b = breaker();

        for _ in 0..5 {
            assert!(fail(&b).await.is_err());
        }
        assert_eq!(b.state(), BreakerState::Open);

        // Sixth call fails fast with CircuitOpen, not the upstream error.
        let err = succeed(&b).await.unwrap_err();
        assert_eq!(err.code(), 5001);
    }

    #[tokio::test(start_paused = true)]
    async fn below_minimum_sample_never_trips() {
        let b = breaker();
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_probes_half_open_then_closes() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60_001)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // One successful trial (max_requests = 1) closes the breaker.
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_resets_timer() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(60_001)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), BreakerState::Open);

        // Timer restarted: still open before the next full timeout.
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn successes_keep_breaker_closed() {
        let b = breaker();
        for _ in 0..20 {
            assert!(succeed(&b).await.is_ok());
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
