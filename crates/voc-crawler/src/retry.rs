//! Exponential back-off with jitter, shared by the crawler, the LLM client and
//! notification channels.
//!
//! Each error type decides what is worth retrying by implementing
//! [`Retriable`]; [`retry_with_backoff`] does the rest.

use std::future::Future;
use std::time::Duration;

const MAX_DELAY_MS: u64 = 60_000;

/// Classifies an error as transient.
pub trait Retriable: std::fmt::Display {
    fn is_retriable(&self) -> bool;

    /// A server-provided wait that replaces the computed back-off.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Total attempt budget and base delay for [`retry_with_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first. Zero behaves like one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_base_ms,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at 60 s, with ±25 % jitter.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let computed = self
            .backoff_base_ms
            .saturating_mul(1u64 << retry.saturating_sub(1).min(10));
        let capped = computed.min(MAX_DELAY_MS);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let jittered = (capped as f64 * (rand::random::<f64>() * 0.5 + 0.75)) as u64;
        Duration::from_millis(jittered)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retriable error, or
/// the attempt budget is spent.
///
/// Returns the final result together with the number of calls made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut operation: F,
) -> (Result<T, E>, u32)
where
    E: Retriable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) => {
                if !err.is_retriable() || attempt >= max_attempts {
                    return (Err(err), attempt);
                }
                let delay = err.retry_after().map_or_else(
                    || policy.delay_for(attempt),
                    |d| d.min(Duration::from_millis(MAX_DELAY_MS)),
                );
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(MAX_DELAY_MS);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms,
                    error = %err,
                    "{label}: transient error, retrying after back-off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Retriable for Flaky {
        fn is_retriable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn delay_is_capped_and_jittered() {
        let policy = RetryPolicy::new(5, 1_000);
        let first = policy.delay_for(1).as_millis();
        assert!((750..=1_250).contains(&first), "got {first}");
        let huge = policy.delay_for(30).as_millis();
        assert!(huge <= 75_000, "got {huge}");
    }

    #[tokio::test]
    async fn stops_at_attempt_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let (result, attempts) = retry_with_backoff(RetryPolicy::new(3, 0), "test", |_| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Flaky(true))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let (result, attempts) = retry_with_backoff(RetryPolicy::new(3, 0), "test", |_| async {
            Err::<(), _>(Flaky(false))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let (result, attempts) =
            retry_with_backoff(RetryPolicy::new(4, 0), "test", |attempt| async move {
                if attempt < 3 {
                    Err(Flaky(true))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }
}
