//! Deadline-bounded retries with exponential backoff.
//!
//! Each attempt decides whether the operation is finished, worth another try,
//! or failed for good. Attempts must be idempotent: the delete flows describe
//! the resource again at the start of every attempt.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::ProviderError;

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Retry<T> {
    /// The operation finished.
    Done(T),
    /// The operation has not finished yet; try again after a delay.
    Retryable(ProviderError),
    /// The operation failed and retrying will not help.
    Fatal(ProviderError),
}

/// Retry timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Wall-clock bound for all attempts together.
    pub deadline: Duration,
    /// Delay after the first retryable attempt.
    pub initial_delay: Duration,
    /// Upper bound of the delay between attempts.
    pub max_delay: Duration,
    /// Factor applied to the delay after every retryable attempt.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// A policy bounded by `deadline` with the default backoff.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            ..Self::default()
        }
    }

    /// The delay before attempt `attempt + 1`, counting from zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Run `attempt` until it reports `Done` or `Fatal`, or the deadline passes.
///
/// Each attempt runs under the time left until the deadline, so an attempt
/// that is still waiting when the deadline passes is abandoned. When the
/// deadline passes after a retryable attempt the last retryable error is
/// reported inside [`ProviderError::DeadlineExceeded`].
pub async fn retry_until<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Retry<T>>,
{
    let started = Instant::now();
    let mut tries: u32 = 0;

    loop {
        let remaining = policy.deadline.saturating_sub(started.elapsed());
        let outcome = match tokio::time::timeout(remaining, attempt()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(ProviderError::DeadlineExceeded(format!(
                    "{} did not finish within {:?}: attempt {} still in progress",
                    operation,
                    policy.deadline,
                    tries + 1
                )))
            },
        };
        let err = match outcome {
            Retry::Done(value) => return Ok(value),
            Retry::Fatal(err) => return Err(err),
            Retry::Retryable(err) => err,
        };

        let elapsed = started.elapsed();
        if elapsed >= policy.deadline {
            return Err(ProviderError::DeadlineExceeded(format!(
                "{} did not finish within {:?}: {}",
                operation, policy.deadline, err
            )));
        }

        let delay = policy
            .delay_for_attempt(tries)
            .min(policy.deadline - elapsed);
        warn!(operation = %operation, attempt = tries + 1, error = %err, ?delay, "Retrying");
        tries += 1;
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy {
            deadline: Duration::from_secs(60),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10)); // capped at max
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_done() {
        let calls = Cell::new(0);
        let result = retry_until(&RetryPolicy::default(), "describe thing", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Retry::Retryable(ProviderError::Validation("not yet".to_string()))
                } else {
                    Retry::Done(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_fatal() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_until(&RetryPolicy::default(), "describe thing", || {
            calls.set(calls.get() + 1);
            async { Retry::Fatal(ProviderError::Validation("broken".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Validation(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_at_deadline() {
        let policy = RetryPolicy::with_deadline(Duration::from_secs(20));
        let started = Instant::now();
        let result: Result<(), _> = retry_until(&policy, "delete thing", || async {
            Retry::Retryable(ProviderError::Validation("still there".to_string()))
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
        assert!(err.to_string().contains("delete thing"));
        assert!(err.to_string().contains("still there"));
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(started.elapsed() < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_abandons_attempt_at_deadline() {
        let policy = RetryPolicy::with_deadline(Duration::from_secs(300));
        let started = Instant::now();
        let result: Result<(), _> = retry_until(&policy, "delete thing", || async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Retry::Retryable(ProviderError::Validation("still there".to_string()))
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
        assert!(err.to_string().contains("still in progress"));
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(started.elapsed() < Duration::from_secs(301));
    }
}
