//! Retry policy and the retry-with-backoff combinator.
//!
//! Transient failures and rate-limit signals are counted against separate
//! attempt ceilings. Sleeping goes through a [`Clock`] so the combinator can
//! be driven by a fake clock in tests.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Retry settings for one class of operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempt ceiling for transient failures, first try included.
    pub max_attempts: u32,
    /// Attempt ceiling for rate-limit signals, first try included.
    pub max_rate_limit_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delays are scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            max_rate_limit_attempts: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (1-based), before jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the next attempt.
    ///
    /// A source-advertised hint wins, capped at `max_delay`. Otherwise the
    /// exponential backoff is jittered.
    #[must_use]
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Explicit slow-down signal, with an optional retry-after hint.
    RateLimited(Option<Duration>),
    /// Worth another try after backoff.
    Transient,
    /// Never retried.
    Fatal,
}

/// Errors that know how they should be retried.
pub trait Retryable {
    fn retry_class(&self) -> RetryClass;
}

/// Why the combinator gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A retry ceiling was reached; `last` is the final failure.
    Exhausted { attempts: u32, last: E },
    /// The operation failed with a non-retryable error.
    Fatal(E),
}

/// Source of delays.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut guard) = self.sleeps.lock() {
            guard.push(duration);
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or a retry ceiling is hit.
///
/// `op` receives the 1-based attempt number. Transient failures and
/// rate-limit signals are counted separately; the backoff exponent follows
/// the count of the class that failed.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] for non-retryable failures and
/// [`RetryError::Exhausted`] once either ceiling is reached.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    let mut transient_failures = 0u32;
    let mut rate_limited = 0u32;

    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let (count, ceiling, hint) = match err.retry_class() {
            RetryClass::Fatal => return Err(RetryError::Fatal(err)),
            RetryClass::Transient => {
                transient_failures += 1;
                (transient_failures, policy.max_attempts, None)
            }
            RetryClass::RateLimited(hint) => {
                rate_limited += 1;
                (rate_limited, policy.max_rate_limit_attempts, hint)
            }
        };

        if count >= ceiling {
            tracing::error!(
                attempt,
                max_attempts = ceiling,
                error = %err,
                "Retries exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay(count, hint);
        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        tracing::warn!(
            attempt,
            max_attempts = ceiling,
            delay_ms,
            error = %err,
            "Retryable error, will retry"
        );
        clock.sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        Slow(Option<u64>),
        Flaky,
        Broken,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn retry_class(&self) -> RetryClass {
            match self {
                Self::Slow(ms) => RetryClass::RateLimited(ms.map(Duration::from_millis)),
                Self::Flaky => RetryClass::Transient,
                Self::Broken => RetryClass::Fatal,
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            max_rate_limit_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            jitter: 0.0,
        }
    }

    async fn run_script(
        policy: &RetryPolicy,
        clock: &RecordingClock,
        script: Vec<Result<u32, TestError>>,
    ) -> (Result<u32, RetryError<TestError>>, Vec<u32>) {
        let script = Mutex::new(VecDeque::from(script));
        let seen = Mutex::new(Vec::new());
        let result = retry_with_backoff(policy, clock, |attempt| {
            seen.lock().unwrap().push(attempt);
            let next = script.lock().unwrap().pop_front().unwrap_or(Err(TestError::Broken));
            async move { next }
        })
        .await;
        (result, seen.into_inner().unwrap())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert_eq!(p.backoff(40), Duration::from_millis(250));
    }

    #[test]
    fn hint_wins_over_backoff() {
        let p = policy();
        assert_eq!(
            p.delay(1, Some(Duration::from_millis(200))),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn hint_is_capped_at_max_delay() {
        let p = policy();
        assert_eq!(p.delay(1, Some(Duration::MAX)), p.max_delay);
        assert_eq!(
            p.delay(1, Some(Duration::from_secs(86_400))),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy {
            jitter: 0.5,
            max_delay: Duration::from_secs(10),
            ..policy()
        };
        for _ in 0..100 {
            let d = p.delay(1, None);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150), "{d:?}");
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let clock = RecordingClock::new();
        let (result, attempts) = run_script(
            &policy(),
            &clock,
            vec![Err(TestError::Flaky), Err(TestError::Flaky), Ok(7)],
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn transient_ceiling_exhausts() {
        let clock = RecordingClock::new();
        let (result, attempts) = run_script(
            &policy(),
            &clock,
            vec![
                Err(TestError::Flaky),
                Err(TestError::Flaky),
                Err(TestError::Flaky),
                Ok(1),
            ],
        )
        .await;
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: TestError::Flaky
            })
        );
        assert_eq!(attempts.len(), 3);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn fatal_is_not_retried() {
        let clock = RecordingClock::new();
        let (result, attempts) =
            run_script(&policy(), &clock, vec![Err(TestError::Broken), Ok(1)]).await;
        assert_eq!(result, Err(RetryError::Fatal(TestError::Broken)));
        assert_eq!(attempts, vec![1]);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_uses_hint_then_backoff() {
        let clock = RecordingClock::new();
        let (result, _) = run_script(
            &policy(),
            &clock,
            vec![Err(TestError::Slow(Some(150))), Err(TestError::Slow(None)), Ok(3)],
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(150), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn hour_long_hint_sleeps_max_delay() {
        let clock = RecordingClock::new();
        let (result, _) = run_script(
            &policy(),
            &clock,
            vec![Err(TestError::Slow(Some(3_600_000))), Ok(4)],
        )
        .await;
        assert_eq!(result, Ok(4));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(250)]);
    }

    #[tokio::test]
    async fn ceilings_are_counted_separately() {
        let clock = RecordingClock::new();
        let (result, attempts) = run_script(
            &policy(),
            &clock,
            vec![
                Err(TestError::Flaky),
                Err(TestError::Slow(None)),
                Err(TestError::Flaky),
                Err(TestError::Slow(None)),
                Ok(9),
            ],
        )
        .await;
        assert_eq!(result, Ok(9));
        assert_eq!(attempts.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_sleeps_on_virtual_time() {
        let start = tokio::time::Instant::now();
        TokioClock.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
