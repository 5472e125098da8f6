//! Exponential backoff retry for model calls.
//!
//! Only retryable provider errors (including timeouts) are retried; anything
//! else is returned after the first failure.

use std::future::Future;
use std::time::Duration;

use crate::errors::ProviderError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries (not including the initial attempt).
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// 3 retries at 1s, 2s, 4s.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// No retries at all.
    pub const NONE: Self = Self {
        max_retries: 0,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    /// All retry delays in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Final result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ProviderError>,
    /// Attempts made, including the initial one.
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails permanently or retries run out.
///
/// `on_failure` sees every failed try (1-indexed attempt number) so callers
/// can trace the full error detail.
pub async fn retry_with_backoff<T, F, Fut>(
    config: RetryConfig,
    mut operation: F,
    mut on_failure: impl FnMut(u32, &ProviderError),
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) => {
                on_failure(attempt, &e);
                if !e.retryable || attempt >= max_attempts {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                tokio::time::sleep(config.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}
