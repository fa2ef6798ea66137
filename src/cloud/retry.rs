//! Bounded retry for transient control-plane errors.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, ScheduleError, StackweaveError};

/// Default number of attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Default upper bound for a single delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 20_000;

/// Exponential backoff policy applied to every remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit bounds.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based), doubling from the base.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error or the
    /// attempts are exhausted.
    ///
    /// A server retry hint replaces the computed delay when present.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or
    /// [`ScheduleError::MaxRetriesExceeded`] once every attempt failed with a
    /// transient error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if attempt >= max_attempts {
                        warn!("{operation} still failing after {attempt} attempts: {e}");
                        return Err(StackweaveError::Schedule(
                            ScheduleError::MaxRetriesExceeded {
                                attempts: attempt,
                                operation: operation.to_string(),
                                last_error: e.to_string(),
                            },
                        ));
                    }

                    let delay = e
                        .retry_delay_secs()
                        .map_or_else(|| self.delay_for(attempt), Duration::from_secs);

                    debug!(
                        "Retry attempt {attempt} of {max_attempts} for {operation} in {}ms: {e}",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
