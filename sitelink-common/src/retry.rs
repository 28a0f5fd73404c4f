//! Retry with exponential backoff.
//!
//! One policy type drives both register reads (retried in place) and queued
//! deliveries (retried across drains). The delay before retry `n` (0-based)
//! is `base_delay * 2^n`.

use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;

use crate::clock::Clock;

/// Bounded retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay unit of the exponential backoff.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Backoff delay after the `attempt`-th failure (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// Run `op` against `state` until it succeeds or the policy is exhausted.
///
/// Between attempts the caller is suspended on `clock` for
/// [`RetryPolicy::backoff`]. The last error is returned once every attempt
/// has failed. `operation` only labels log records.
pub async fn retry_with_backoff<S, T, E, F>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    operation: &str,
    state: &mut S,
    mut op: F,
) -> Result<T, E>
where
    S: ?Sized + Send,
    T: Send,
    E: fmt::Display + Send,
    F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, E>> + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op(state).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(operation, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    tracing::warn!(
                        operation,
                        attempts = attempt,
                        error = %e,
                        "Giving up after retries"
                    );
                    return Err(e);
                }

                let delay = policy.backoff(attempt - 1);
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                clock.sleep(delay).await;
            }
        }
    }
}
