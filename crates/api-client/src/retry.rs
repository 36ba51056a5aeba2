//! Retry policy for cloud API calls: exponential backoff with full jitter

use crate::ApiError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff base; attempt n sleeps up to `base * 2^n`, capped.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff ceiling for a zero-based attempt number, before jitter.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails terminally, exhausts attempts,
/// or the token is cancelled. Only errors for which
/// [`ApiError::is_retryable`] holds are retried; each sleep is a uniform
/// draw from zero to the backoff ceiling (full jitter).
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                let ceiling = config.backoff_ceiling(attempt);
                let sleep = jittered(ceiling);
                debug!(
                    attempt = attempt + 1,
                    error = %err,
                    delay_ms = sleep.as_millis() as u64,
                    "retrying cloud call"
                );
                last_error = Some(err);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or(ApiError::Cancelled))
}

fn jittered(ceiling: Duration) -> Duration {
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    let millis = ceiling.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_ceiling(0), Duration::from_millis(200));
        assert_eq!(config.backoff_ceiling(1), Duration::from_millis(400));
        assert_eq!(config.backoff_ceiling(2), Duration::from_millis(800));
        assert_eq!(config.backoff_ceiling(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&config, &CancellationToken::new(), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ApiError::Status {
                        status: 503,
                        message: "unavailable".to_string(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> =
            retry_with_backoff(&RetryConfig::default(), &CancellationToken::new(), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::NoSeat)
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), ApiError::NoSeat));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let result: Result<(), _> =
            retry_with_backoff(&config, &CancellationToken::new(), || async {
                Err(ApiError::Status {
                    status: 502,
                    message: "bad gateway".to_string(),
                })
            })
            .await;

        match result.unwrap_err() {
            ApiError::Status { status, .. } => assert_eq!(status, 502),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            retry_with_backoff(&RetryConfig::default(), &cancel, || async {
                Ok(())
            })
            .await;
        assert!(matches!(result.unwrap_err(), ApiError::Cancelled));
    }
}
