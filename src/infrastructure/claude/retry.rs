//! Retry policy with exponential backoff for agent invocations.
//!
//! Backoff doubles with each retry: 10s -> 20s -> 40s -> 80s -> 160s -> 300s (max).
//! Retries `AgentInvokerError::is_transient()` errors only; permanent errors (bad
//! key, malformed request) and cancellation return immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::domain::error::AgentInvokerError;

pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, AgentInvokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentInvokerError>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_transient() || attempt >= self.max_retries {
                        return Err(err);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    warn!(attempt = attempt + 1, max = self.max_retries, ?backoff, %err, "retrying agent invocation");
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        Duration::from_millis(backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_backoff(0), Duration::from_millis(10_000));
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(20_000));
        assert_eq!(policy.calculate_backoff(5), Duration::from_millis(300_000));
        assert_eq!(policy.calculate_backoff(6), Duration::from_millis(300_000));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let policy = RetryPolicy::default();
        let count = Arc::new(AtomicU32::new(0));
        let result = policy
            .execute(|| {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AgentInvokerError>(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy::new(3, 1, 10);
        let count = Arc::new(AtomicU32::new(0));
        let result = policy
            .execute(|| {
                let count = Arc::clone(&count);
                async move {
                    let attempt = count.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        Err(AgentInvokerError::ServerError("boom".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let policy = RetryPolicy::new(3, 1, 10);
        let count = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = policy
            .execute(|| {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(AgentInvokerError::InvalidApiKey)
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let policy = RetryPolicy::new(2, 1, 10);
        let count = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = policy
            .execute(|| {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(AgentInvokerError::RateLimited {
                        retry_after_secs: None,
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
