//! Timeout with cancellation signalling and a cleanup grace period.
//!
//! On deadline the unit of work's token is cancelled and the work gets a
//! grace period to clean up (abort in-flight HTTP, drop partial frames).
//! The call returns `Timeout` either way.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use agentmesh_core::error::{ResilienceError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline for the whole wrapped call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Cleanup window after cancellation is signalled
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_grace_ms() -> u64 {
    1_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            grace_ms: default_grace_ms(),
        }
    }
}

/// Deadline wrapper handing the work a child token that is cancelled when
/// the deadline fires (or when the parent token is cancelled).
#[derive(Debug, Clone)]
pub struct Timeout {
    config: TimeoutConfig,
}

impl Timeout {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let started = Instant::now();
        let child = cancel.child_token();
        let deadline = Duration::from_millis(self.config.timeout_ms);
        let grace = Duration::from_millis(self.config.grace_ms);

        let fut = work(child.clone());
        tokio::pin!(fut);

        tokio::select! {
            out = &mut fut => out,
            _ = tokio::time::sleep(deadline) => {
                debug!(timeout_ms = self.config.timeout_ms, "Deadline hit — signalling cancellation");
                child.cancel();

                // Let the work observe the cancellation and clean up.
                tokio::select! {
                    _ = &mut fut => {}
                    _ = tokio::time::sleep(grace) => {}
                }

                Err(ResilienceError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
                .into())
            }
        }
    }
}
