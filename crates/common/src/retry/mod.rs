//! Exponential-backoff retry executor
//!
//! Attempt `n` (0-based) that fails sleeps `base_delay * 2^n` before the next
//! call. Failures the taxonomy marks as not retryable (no data, invalid
//! query) return immediately.

use crate::errors::{AppError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Passed to the progress callback before each backoff sleep.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// 1-based number of the retry about to happen
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub error: &'a AppError,
}

/// Delay before retry number `attempt + 1`.
pub fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    base_delay.saturating_mul(1u32 << attempt.min(16))
}

pub async fn with_retry<T, F, Fut>(
    operation: F,
    max_retries: u32,
    base_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_notify(operation, max_retries, base_delay, |_| {}).await
}

pub async fn with_retry_notify<T, F, Fut, P>(
    mut operation: F,
    max_retries: u32,
    base_delay: Duration,
    mut on_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&RetryAttempt<'_>),
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries && e.rag_kind().is_retryable() => {
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                on_retry(&RetryAttempt {
                    attempt: attempt + 1,
                    max_retries,
                    delay,
                    error: &e,
                });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retry_cadence_on_persistent_failure() {
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let d = Duration::from_millis(100);

        let recorder = calls.clone();
        let result: Result<()> = with_retry(
            move || {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(Instant::now());
                    Err(AppError::VectorIndexConnection {
                        message: "connection refused".into(),
                    })
                }
            },
            3,
            d,
        )
        .await;

        assert!(result.is_err());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1] - calls[0], d);
        assert_eq!(calls[2] - calls[1], d * 2);
        assert_eq!(calls[3] - calls[2], d * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let mut seen = Vec::new();

        let value = with_retry_notify(
            move || {
                let counter = counter.clone();
                async move {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    if *n < 3 {
                        Err(AppError::EmbeddingError {
                            message: "503".into(),
                        })
                    } else {
                        Ok(*n)
                    }
                }
            },
            3,
            Duration::from_millis(10),
            |a| seen.push((a.attempt, a.delay)),
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(
            seen,
            vec![(1, Duration::from_millis(10)), (2, Duration::from_millis(20))]
        );
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let result: Result<()> = with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err(AppError::InvalidQuery {
                        message: "empty".into(),
                    })
                }
            },
            3,
            Duration::from_secs(60),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(*attempts.lock().unwrap(), 1);
    }
}
