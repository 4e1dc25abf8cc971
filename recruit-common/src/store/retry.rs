//! Retry with exponential backoff for transient store failures
//!
//! Only `ErrorClass::Transient` errors are retried. Permanent errors and
//! uniqueness conflicts return immediately; conflict handling belongs to the
//! caller, which must re-read state before trying again.

use super::StoreError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Backoff policy for store calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each further failure
    pub base_delay: Duration,
    /// Upper bound for any single delay, including server `Retry-After` hints
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` is the 1-based
    /// number of the attempt that just failed
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32, err: &StoreError) -> Duration {
        err.retry_after()
            .unwrap_or_else(|| self.backoff(attempt))
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails non-transiently, or the policy
/// runs out of attempts
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let start_time = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Store operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        error = %err,
                        "Store operation failed: retries exhausted"
                    );
                    return Err(StoreError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }

                let delay = policy.delay_for(attempt, &err);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient store failure, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
