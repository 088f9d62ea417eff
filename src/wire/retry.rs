//! Retry policy
//!
//! Exponential backoff with jitter: base × 2^attempt, capped, ±25%.
//! Only transient errors are retried; auth, integrity, crypto, and
//! cancellation surface immediately.

use std::future::Future;
use std::time::Duration;

use crate::config::RetrySection;
use crate::{Error, Result};

pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(cap_ms);
    // ±25% jitter.
    let jitter = (capped / 4).max(1);
    let low = capped.saturating_sub(jitter);
    let high = capped + jitter;
    Duration::from_millis(fastrand::u64(low..=high))
}

/// Run `op` with the configured retry budget. `NotFound` is retried like a
/// transient error when `retry_not_found` is set (posting propagation lag)
/// and surfaced immediately otherwise (redundancy fallback decides).
pub async fn with_retry<T, F, Fut>(
    policy: &RetrySection,
    retry_not_found: bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let retryable =
                    e.is_transient() || (retry_not_found && matches!(e, Error::NotFound(_)));
                if !retryable || attempt + 1 >= policy.attempts {
                    return Err(e);
                }
                let delay = backoff_delay(attempt, policy.base_ms, policy.cap_ms);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetrySection {
        RetrySection {
            attempts: 4,
            base_ms: 1,
            cap_ms: 4,
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        for attempt in 0..10 {
            let d = backoff_delay(attempt, 500, 30_000);
            assert!(d.as_millis() <= 30_000 + 7_500);
        }
        // Attempt 0 stays near the base.
        let d0 = backoff_delay(0, 500, 30_000);
        assert!(d0.as_millis() >= 375 && d0.as_millis() <= 625);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), false, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::protocol("400 temporarily unavailable"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_surfaces_original() {
        let result: Result<()> = with_retry(&fast_policy(), false, || async {
            Err(Error::protocol("400 busy"))
        })
        .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_fatal_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_policy(), false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Auth("481 rejected".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_policy_switch() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_policy(), false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("430".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let _: Result<()> = with_retry(&fast_policy(), true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("430".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
