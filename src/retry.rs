//! Bounded retry for transient failures.
//!
//! Hub calls, metadata lookups and Fetcher invocations all follow the same
//! rule: retry a fixed number of times with a delay, then give up and let the
//! caller raise an alert. The delay is fixed by default; a multiplier above
//! 1.0 turns it into exponential backoff capped at `max_delay`.
//!
//! Only errors that classify themselves as transient are retried. Permanent
//! errors are returned after the first attempt.

use std::future::Future;
use std::time::Duration;

/// Classification hook for errors passed through [`retry`].
pub trait Retryable {
    /// Returns true if the operation may succeed when attempted again.
    fn is_transient(&self) -> bool;
}

/// Configuration for bounded retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub delay: Duration,

    /// Cap for the delay when a multiplier is in effect.
    pub max_delay: Duration,

    /// Growth factor between retries; 1.0 means a fixed delay.
    pub multiplier: f64,
}

impl RetryConfig {
    /// Three attempts, five seconds apart.
    pub const DEFAULT: Self = Self::fixed(3, Duration::from_secs(5));

    /// Fixed delay between attempts.
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Exponential backoff starting at `delay`, capped at `max_delay`.
    pub fn backoff(
        max_attempts: u32,
        delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            delay,
            max_delay,
            multiplier,
        }
    }

    /// Single attempt, no retry.
    pub const fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay to wait after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let secs = self.delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64().max(self.delay.as_secs_f64()));
        Duration::from_secs_f64(capped)
    }

    /// Iterator over every delay that may be slept.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|attempt| self.delay_for_attempt(attempt))
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of [`retry`].
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation succeeded.
    Success(T),

    /// Every attempt failed with a transient error.
    ExhaustedRetries {
        /// The last error encountered.
        last_error: E,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A permanent error stopped the loop early.
    PermanentError(E),
}

impl<T, E> RetryResult<T, E> {
    /// Collapses exhausted and permanent failures into `Err`.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::ExhaustedRetries { last_error, .. } => Err(last_error),
            RetryResult::PermanentError(e) => Err(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the attempt
/// budget is spent.
pub async fn retry<T, E, F, Fut>(config: RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) => {
                attempt += 1;

                if !e.is_transient() {
                    return RetryResult::PermanentError(e);
                }
                if attempt >= max_attempts {
                    return RetryResult::ExhaustedRetries {
                        last_error: e,
                        attempts: attempt,
                    };
                }

                tokio::time::sleep(config.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}
