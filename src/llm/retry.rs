//! Retry wrapper with exponential backoff

use super::types::{LlmError, RetryPolicy};
use std::future::Future;
use tracing::debug;

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. Returns the value together with the number of
/// attempts made (`1..=max_retries + 1`).
///
/// The closure receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<(T, u32), LlmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt + 1)),
            Err(e) => {
                if !e.is_retryable() || attempt >= policy.max_retries {
                    return Err(e);
                }

                // Prefer the server-specified delay when there is one
                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| policy.delay_for_attempt(attempt));

                debug!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying model call"
                );

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
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    /// Fails a specified number of times before succeeding
    async fn flaky(
        calls: &AtomicU32,
        fail_times: u32,
        error: LlmError,
    ) -> Result<&'static str, LlmError> {
        let count = calls.fetch_add(1, Ordering::SeqCst);
        if count < fail_times {
            Err(error)
        } else {
            Ok("success")
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let (value, attempts) = with_retry(&fast_policy(3), |_| {
            flaky(&calls, 2, LlmError::rate_limit(None))
        })
        .await
        .unwrap();

        assert_eq!(value, "success");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(2), |_| {
            flaky(&calls, 10, LlmError::network("reset"))
        })
        .await;

        assert!(matches!(result, Err(LlmError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), |_| {
            flaky(&calls, 10, LlmError::auth("invalid token"))
        })
        .await;

        assert!(matches!(result, Err(LlmError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(0), |_| {
            flaky(&calls, 1, LlmError::contract("missing field"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
