//! Bulkhead — bounded concurrency for calls to one downstream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use agentmesh_core::error::{ResilienceError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Maximum in-flight calls
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Longest a caller waits for a permit
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_max_concurrent() -> u32 {
    10
}
fn default_max_wait_ms() -> u64 {
    1_000
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

/// Semaphore-backed concurrency limiter.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_wait: Duration,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }

    /// Run `work` under a permit; fail with `BulkheadFull` if no permit
    /// frees up within the configured wait.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(ResilienceError::Cancelled.into()),
            acquired = tokio::time::timeout(self.max_wait, self.semaphore.acquire()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    // Semaphore is never closed.
                    Ok(Err(_)) => return Err(ResilienceError::Cancelled.into()),
                    Err(_) => {
                        return Err(ResilienceError::BulkheadFull {
                            waited_ms: self.max_wait.as_millis() as u64,
                        }
                        .into());
                    }
                }
            }
        };

        let result = work().await;
        drop(permit);
        result
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulkhead(max_concurrent: u32, max_wait_ms: u64) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new(BulkheadConfig {
            max_concurrent,
            max_wait_ms,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn limits_concurrency() {
        let b = bulkhead(1, 50);
        let cancel = CancellationToken::new();

        let b2 = b.clone();
        let holder = tokio::spawn(async move {
            b2.call(&CancellationToken::new(), || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await
        });

        // Give the holder time to take the permit.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = b
            .call(&cancel, || async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), 5002);

        holder.await.unwrap().unwrap();
        assert_eq!(b.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_freed_permit() {
        let b = bulkhead(1, 1_000);

        let b2 = b.clone();
        let holder = tokio::spawn(async move {
            b2.call(&CancellationToken::new(), || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        // Permit frees after ~200ms, inside our 1s wait.
        b.call(&CancellationToken::new(), || async { Ok(()) })
            .await
            .unwrap();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_preempts_wait() {
        let b = bulkhead(1, 10_000);

        let b2 = b.clone();
        let _holder = tokio::spawn(async move {
            b2.call(&CancellationToken::new(), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = b.call(&cancel, || async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code(), 5102);
    }
}
