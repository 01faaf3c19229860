//! Bounded retry with a swappable backoff policy
//!
//! The policy knows nothing about I/O. Callers hand it an operation and a
//! classification function; it decides whether another attempt is worth
//! making and how long to wait before it.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    /// Same delay after every failure
    Fixed { delay: Duration },
    /// `step * attempt`
    Linear { step: Duration },
    /// `initial * 2^(attempt-1)`, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after attempt number `attempt` (1-based) failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Whether a failed attempt may be repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Permanent,
}

/// Successful result with the attempt number that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why the policy gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every allowed attempt failed with a retryable error
    Exhausted,
    /// The error was classified permanent
    Permanent,
    /// Waiting for the next attempt would cross the deadline
    DeadlineExceeded,
}

/// Terminal failure: the last error and how many attempts were made
#[derive(Debug, Clone)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    pub reason: FailureReason,
}

/// Bounded retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 behave as 1
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear { step },
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { initial, max },
        }
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts, or
    /// the next backoff would end past `deadline`.
    ///
    /// `op` receives the 1-based attempt number. The deadline only governs
    /// sleeping; bounding a single in-flight attempt is the caller's job.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        deadline: Option<Instant>,
        classify: C,
        mut op: F,
    ) -> Result<Retried<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Classification,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if classify(&error) == Classification::Permanent {
                warn!(attempt, error = %error, "Permanent failure, not retrying");
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    reason: FailureReason::Permanent,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    attempt,
                    max_attempts,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    reason: FailureReason::Exhausted,
                });
            }

            let delay = self.backoff.delay_for(attempt);
            if let Some(deadline) = deadline {
                if Instant::now() + delay > deadline {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Next retry would cross the deadline"
                    );
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        reason: FailureReason::DeadlineExceeded,
                    });
                }
            }

            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Broken,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn classify(err: &TestError) -> Classification {
        match err {
            TestError::Flaky => Classification::Retryable,
            TestError::Broken => Classification::Permanent,
        }
    }

    #[test]
    fn test_backoff_schedules() {
        let fixed = Backoff::Fixed {
            delay: Duration::from_secs(5),
        };
        assert_eq!(fixed.delay_for(1), Duration::from_secs(5));
        assert_eq!(fixed.delay_for(3), Duration::from_secs(5));

        let linear = Backoff::Linear {
            step: Duration::from_secs(2),
        };
        assert_eq!(linear.delay_for(1), Duration::from_secs(2));
        assert_eq!(linear.delay_for(3), Duration::from_secs(6));

        let exponential = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(exponential.delay_for(1), Duration::from_secs(1));
        assert_eq!(exponential.delay_for(3), Duration::from_secs(4));
        assert_eq!(exponential.delay_for(10), Duration::from_secs(10));
        assert_eq!(exponential.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_with_fixed_sleeps() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = policy
            .execute(None, classify, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, Retried { value: 42, attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        let calls = AtomicU32::new(0);

        let failure = policy
            .execute(None, classify, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Flaky) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.reason, FailureReason::Exhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.error, TestError::Flaky);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let failure = policy
            .execute(None, classify, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Broken) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.reason, FailureReason::Permanent);
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_before_sleeping_past_it() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(5));
        let deadline = Instant::now() + Duration::from_secs(12);
        let calls = AtomicU32::new(0);

        let failure = policy
            .execute(Some(deadline), classify, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Flaky) }
            })
            .await
            .unwrap_err();

        // attempts at t=0, t=5, t=10; a third sleep would end at t=15
        assert_eq!(failure.reason, FailureReason::DeadlineExceeded);
        assert_eq!(failure.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::linear(0, Duration::from_secs(1));
        let result = policy
            .execute(None, classify, |attempt| async move { Ok::<_, TestError>(attempt) })
            .await
            .unwrap();
        assert_eq!(result.attempts, 1);
    }
}
