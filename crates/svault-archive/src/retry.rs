//! Bounded retry with exponential backoff for transport calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use svault_storage::TransportError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Deadline for a single attempt; expiry counts as a failed attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (1-based `attempt`).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

/// Result of a retried call together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, TransportError>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Failure(format!(
                "timed out after {}s",
                policy.attempt_timeout.as_secs_f64()
            ))),
        };

        match outcome {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_retryable() && attempt < max => {
                let delay = policy.backoff(attempt);
                warn!(what, attempt, max, delay_ms = delay.as_millis() as u64, "retrying: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                }
            }
        }
    }
}
