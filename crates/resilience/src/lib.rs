//! Resilience primitives for AgentMesh.
//!
//! Five reusable wrappers around arbitrary async units of work — retry,
//! circuit breaker, token-bucket rate limiter, bulkhead, and timeout —
//! plus [`ResilienceStack`], which composes all five in the order the
//! invocation engine uses. Every wrapper is cancellation-aware: a
//! cancelled token makes waits return `Cancelled` immediately.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;
pub mod stack;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig};
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use rate_limit::{RateLimiterConfig, TokenBucket};
pub use retry::{RetryConfig, RetryPolicy};
pub use stack::{ResilienceConfig, ResilienceStack};
pub use timeout::{Timeout, TimeoutConfig};
