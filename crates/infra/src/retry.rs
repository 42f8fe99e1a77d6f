//! Bounded retry with backoff for transient store conflicts.
//!
//! ## Design
//!
//! - Strategy-agnostic: wraps any async attempt whose error knows whether it
//!   is retryable
//! - Terminal errors propagate on first occurrence
//! - Attempts are bounded; exhaustion is its own error, never an endless loop
//! - Exponential backoff with jitter between attempts, slept with
//!   `tokio::time::sleep` so dropping the future cancels the wait

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can tell a transient failure from a terminal one.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included (minimum 1)
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0): each delay is moved by up to ±jitter of itself
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempts actually made; a zero in the config still runs once.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Calculate the un-jittered delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Delay after a failed attempt, with random jitter applied.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay_ms = self.delay_for_attempt(attempt).as_millis() as f64;
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with an error retrying cannot fix.
    #[error(transparent)]
    Terminal(E),
}

/// Run `operation` until it succeeds, fails terminally, or the policy runs
/// out of attempts.
///
/// `operation` receives the 1-indexed attempt number. It must open a fresh
/// unit of work on every call; nothing from a failed attempt is reused.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt, "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(RetryError::Terminal(err)),
            Err(err) if !policy.should_retry(attempt) => {
                warn!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                let delay = policy.jittered_delay(attempt, &mut rand::rng());
                debug!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient conflict, retrying after backoff"
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

    #[derive(Debug, PartialEq)]
    enum TestError {
        Busy,
        Broken,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Busy)
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy =
            RetryPolicy::exponential(50, Duration::from_millis(100), Duration::from_secs(1))
                .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.5);
        let mut rng = rand::rng();

        for _ in 0..200 {
            let d = policy.jittered_delay(2, &mut rng);
            assert!(d >= Duration::from_millis(100), "{d:?}");
            assert!(d <= Duration::from_millis(300), "{d:?}");
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = fast(3);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = with_retry(&fast(5), "test", |_| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError::Busy)
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&fast(5), "test", |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Broken)
        })
        .await;

        assert!(matches!(result, Err(RetryError::Terminal(TestError::Broken))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&fast(4), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                assert!(attempt <= 4);
                Err(TestError::Busy)
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                last: TestError::Busy
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_max_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 0,
            ..fast(1)
        };

        let result: Result<(), _> = with_retry(&policy, "test", |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Busy)
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
