//! Exponential backoff for transient transfer failures
//!
//! Delays grow by `backoff_multiplier` from `initial_delay_ms` up to
//! `max_delay_ms`. With jitter enabled each delay is stretched by a random
//! factor between 1x and 2x.

use crate::error::TransferError;
use dlq_types::{DownloadId, RetryConfig};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run `operation` until it succeeds, fails permanently or runs out of
/// retries.
///
/// Cancelling `cancel` cuts a backoff sleep short and returns the last
/// error; callers check the token to tell that apart from a real failure.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    id: DownloadId,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0;
    let max_delay = Duration::from_millis(config.max_delay_ms);
    let mut delay = Duration::from_millis(config.initial_delay_ms).min(max_delay);

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(id, attempts = attempt + 1, "Transfer succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                let wait = if config.jitter { add_jitter(delay) } else { delay };
                warn!(
                    id,
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = wait.as_millis() as u64,
                    "Transfer failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(wait) => {}
                }

                delay = next_delay(delay, config.backoff_multiplier, max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(id, error = %e, attempts = attempt + 1, "Retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Grow `delay` by `multiplier`, capped at `max_delay`. Products that are
/// negative, NaN or too large for a `Duration` fall back to the cap.
fn next_delay(delay: Duration, multiplier: f64, max_delay: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier)
        .unwrap_or(max_delay)
        .min(max_delay)
}

fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + factor)).unwrap_or(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&fast(3), 1, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransferError::Transient("Server error: 503".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&fast(2), 1, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Transient("timeout".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&fast(5), 1, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Permanent("Server error: 404 Not Found".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(TransferError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_cuts_backoff_short() {
        let config = RetryConfig {
            initial_delay_ms: 60_000,
            ..fast(5)
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let result: Result<(), _> = with_retry(&config, 1, &cancel, || async {
            Err(TransferError::Transient("reset".into()))
        })
        .await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn delay_growth_never_panics() {
        let max = Duration::from_secs(60);
        let one = Duration::from_secs(1);

        assert_eq!(next_delay(one, 2.0, max), Duration::from_secs(2));
        assert_eq!(next_delay(Duration::from_secs(50), 2.0, max), max);
        assert_eq!(next_delay(one, -1.0, max), max);
        assert_eq!(next_delay(one, f64::NAN, max), max);
        assert_eq!(next_delay(one, f64::INFINITY, max), max);
    }

    #[tokio::test]
    async fn negative_multiplier_still_retries_to_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = RetryConfig {
            max_delay_ms: 20,
            backoff_multiplier: -1.0,
            ..fast(3)
        };

        let result: Result<(), _> = with_retry(&config, 1, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Transient("Server error: 503".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(TransferError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
