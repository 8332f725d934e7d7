//! Retry with linear backoff for transient failures.
//!
//! Components retry transient errors a few times inside one cycle; once the
//! attempts are exhausted the error is escalated and the next cycle starts
//! from the current desired-vs-observed diff again.

use crate::error::SrmError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempts and backoff step. The delay before attempt `n + 1` is
/// `backoff * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Policy for HTTP calls between agents and the frontend.
    pub const fn http() -> Self {
        Self::new(3, Duration::from_secs(1))
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::http()
    }
}

/// Errors that know whether another attempt may help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for SrmError {
    fn is_retryable(&self) -> bool {
        SrmError::is_retryable(self)
    }
}

/// Runs `f` until it succeeds, returns a non-retryable error, or the
/// attempts are exhausted.
pub async fn retry<F, Fut, T, E>(policy: RetryPolicy, what: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() {
                    return Err(err);
                }
                if attempt >= policy.attempts {
                    warn!(
                        operation = what,
                        attempt = attempt,
                        error = %err,
                        "Retry attempts exhausted"
                    );
                    return Err(err);
                }
                let delay = policy.delay(attempt);
                warn!(
                    operation = what,
                    attempt = attempt,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::http();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, SrmError> = retry(fast(3), "fetch", || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(SrmError::database("select", "locked"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), SrmError> = retry(fast(3), "fetch", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SrmError::database("select", "locked")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), SrmError> = retry(fast(3), "submit", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SrmError::bad_request("missing id")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
