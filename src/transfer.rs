use anyhow::{Context, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::is_retryable;

pub const CHUNK_RETRY_ATTEMPTS: u32 = 10;
const CHUNK_RETRY_BASE_DELAY_MS: u64 = 500;
const CHUNK_RETRY_MAX_DELAY_MS: u64 = 8_000;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: CHUNK_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(CHUNK_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(CHUNK_RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Exponential delay for the given 1-based attempt, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let backoff = base_ms.saturating_mul(2_u64.pow(exponent));
        Duration::from_millis(backoff.min(self.max_delay.as_millis() as u64))
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ceiling = (backoff.as_millis() as u64) / 2;
        if jitter_ceiling == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ceiling))
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. The last error is returned as-is with
    /// attempt context attached.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if is_retryable(&err) && attempt < self.max_attempts {
                        let delay = self.delay_with_jitter(attempt);
                        log::warn!(
                            "{} failed (attempt {}/{}), retrying in {}ms: {}",
                            operation_name,
                            attempt,
                            self.max_attempts,
                            delay.as_millis(),
                            err
                        );
                        sleep(delay).await;
                        continue;
                    }

                    let context = if attempt > 1 {
                        format!("{} failed after {} attempts", operation_name, attempt)
                    } else {
                        format!("{} failed", operation_name)
                    };
                    return Err(err).context(context);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceRequestError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(10), Duration::from_millis(8_000));
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = RetryPolicy::no_delay(5)
            .run("chunk upload", move || {
                let calls = calls_clone.clone();
                async move {
                    let current = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if current < 3 {
                        Err(ServiceRequestError::new(503, "unavailable").into())
                    } else {
                        Ok(current)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let err = RetryPolicy::no_delay(5)
            .run("chunk upload", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ServiceRequestError::new(403, "forbidden").into())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let service = err.downcast_ref::<ServiceRequestError>().unwrap();
        assert_eq!(service.status_code, 403);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let err = RetryPolicy::no_delay(4)
            .run("chunk upload", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ServiceRequestError::new(500, "boom").into())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("failed after 4 attempts"));
        assert_eq!(
            err.downcast_ref::<ServiceRequestError>().unwrap().status_code,
            500
        );
    }
}
