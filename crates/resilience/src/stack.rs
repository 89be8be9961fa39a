//! The composed resilience stack used by the invocation engine.
//!
//! Nesting, outermost first: Timeout → Bulkhead → CircuitBreaker → Retry,
//! with the rate limiter consulted inside each retry attempt. The breaker
//! therefore sees one outcome per composed call (post-retry), every retry
//! attempt pays the rate limit, the bulkhead caps total in-flight
//! compositions, and the timeout bounds the whole thing.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use agentmesh_core::error::Result;

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
use crate::rate_limit::{RateLimiterConfig, TokenBucket};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::timeout::{Timeout, TimeoutConfig};

/// Per-adapter resilience configuration, one sub-table per primitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub bulkhead: BulkheadConfig,

    #[serde(default)]
    pub timeout: TimeoutConfig,
}

/// All five primitives wired together for one downstream.
#[derive(Debug)]
pub struct ResilienceStack {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    limiter: TokenBucket,
    bulkhead: Bulkhead,
    timeout: Timeout,
    wait_limit: Duration,
}

impl ResilienceStack {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            retry: RetryPolicy::new(config.retry),
            breaker: CircuitBreaker::new(config.circuit_breaker),
            limiter: TokenBucket::from_config(&config.rate_limiter),
            bulkhead: Bulkhead::new(config.bulkhead),
            timeout: Timeout::new(config.timeout),
            wait_limit: Duration::from_millis(config.rate_limiter.wait_limit_ms),
        }
    }

    /// Current breaker state, for health reporting.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// The rate limiter, exposed so observed upstream headers can adjust it.
    pub fn limiter(&self) -> &TokenBucket {
        &self.limiter
    }

    /// Run `work` through the full composition. The closure receives a
    /// token that is cancelled on deadline or caller cancellation and is
    /// invoked once per retry attempt.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        T: Send,
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let retry = &self.retry;
        let breaker = &self.breaker;
        let limiter = &self.limiter;
        let bulkhead = &self.bulkhead;
        let wait_limit = self.wait_limit;
        let work = &work;

        self.timeout
            .call(cancel, move |token| async move {
                let token_ref = &token;
                bulkhead
                    .call(token_ref, move || async move {
                        breaker
                            .call(move || async move {
                                retry
                                    .call(token_ref, move |_attempt| {
                                        let token = token_ref.clone();
                                        async move {
                                            limiter.wait(wait_limit, &token).await?;
                                            work(token.clone()).await
                                        }
                                    })
                                    .await
                            })
                            .await
                    })
                    .await
            })
            .await
    }
}
