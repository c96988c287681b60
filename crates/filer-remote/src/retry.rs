//! Policy-driven retry with backoff
//!
//! [`Retrying`] re-invokes a fallible async operation while its
//! [`RetryClassifier`] says the failure is transient and the [`RetryPolicy`]
//! still allows another attempt. When it gives up, the last error is returned
//! unchanged.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, ErrorKind, Result};

/// How long to pause between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Always `interval`
    Fixed,
    /// `interval * backoff_rate^(attempt - 1)`
    Exponential,
    /// A uniformly random pause up to the exponential bound
    RandomExponential,
}

/// When to stop retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Give up once this many attempts have been made
    After(u32),
    Never,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    interval: Duration,
    backoff_rate: f64,
    max_backoff: Option<Duration>,
    wait: Wait,
    stop: Stop,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            backoff_rate: 2.0,
            max_backoff: None,
            wait: Wait::Exponential,
            stop: Stop::After(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff starting at `interval`, doubling, for at most
    /// `retries` attempts. `retries` must be at least 1.
    pub fn new(interval: Duration, retries: u32) -> Result<Self> {
        if retries < 1 {
            return Err(Error::InvalidConfig(format!(
                "Retries must be greater than or equal to 1 (received: {retries})"
            )));
        }

        Ok(Self {
            interval,
            stop: Stop::After(retries),
            ..Self::default()
        })
    }

    /// Multiplier applied to the pause after each failure. Must be finite
    /// and at least 1.
    pub fn backoff_rate(mut self, rate: f64) -> Result<Self> {
        if !rate.is_finite() || rate < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "Backoff rate must be a finite number >= 1 (received: {rate})"
            )));
        }
        self.backoff_rate = rate;
        Ok(self)
    }

    /// Cap every pause at `max`
    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = Some(max);
        self
    }

    /// Jitter each pause uniformly between zero and its exponential bound
    pub fn wait_random(mut self) -> Self {
        self.wait = Wait::RandomExponential;
        self
    }

    pub fn fixed(mut self) -> Self {
        self.wait = Wait::Fixed;
        self
    }

    /// Ignore the attempt cap and retry until the classifier rejects a failure
    pub fn infinite(mut self) -> Self {
        self.stop = Stop::Never;
        self
    }

    pub fn stop(&self) -> Stop {
        self.stop
    }

    pub fn wait(&self) -> Wait {
        self.wait
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        match self.stop {
            Stop::After(max) => attempt < max,
            Stop::Never => true,
        }
    }

    /// The pause taken after attempt number `attempt` (1-based) fails
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let bound = match self.wait {
            Wait::Fixed => self.interval.as_secs_f64(),
            Wait::Exponential | Wait::RandomExponential => {
                self.interval.as_secs_f64() * self.backoff_rate.powi(exponent)
            }
        };
        let bound = match self.max_backoff {
            Some(max) => bound.min(max.as_secs_f64()),
            None => bound,
        };

        let secs = match self.wait {
            Wait::RandomExponential if bound > 0.0 && bound.is_finite() => {
                rand::rng().random_range(0.0..=bound)
            }
            _ => bound,
        };

        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Decides whether a failure is transient and worth another attempt
pub trait RetryClassifier<E>: Send + Sync {
    fn should_retry(&self, error: &E) -> bool;

    /// Retry when either classifier matches
    fn or<C>(self, other: C) -> Or<Self, C>
    where
        Self: Sized,
        C: RetryClassifier<E>,
    {
        Or(self, other)
    }
}

impl<E, F> RetryClassifier<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// Matches every failure
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl<E> RetryClassifier<E> for RetryAll {
    fn should_retry(&self, _error: &E) -> bool {
        true
    }
}

/// Matches failures by category
#[derive(Debug, Clone)]
pub struct RetryIfKind(Vec<ErrorKind>);

impl RetryIfKind {
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self(kinds.into_iter().collect())
    }
}

impl RetryClassifier<Error> for RetryIfKind {
    fn should_retry(&self, error: &Error) -> bool {
        self.0.contains(&error.kind())
    }
}

/// Matches process failures whose exit code is in a fixed set. Any other
/// failure, including a process failure with a different code, propagates.
#[derive(Debug, Clone)]
pub struct RetryIfExitCode {
    codes: Vec<i32>,
}

impl RetryIfExitCode {
    pub fn new(codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }
}

impl RetryClassifier<Error> for RetryIfExitCode {
    fn should_retry(&self, error: &Error) -> bool {
        error
            .exit_code()
            .is_some_and(|code| self.codes.contains(&code))
    }
}

#[derive(Debug, Clone)]
pub struct Or<A, B>(A, B);

impl<E, A, B> RetryClassifier<E> for Or<A, B>
where
    A: RetryClassifier<E>,
    B: RetryClassifier<E>,
{
    fn should_retry(&self, error: &E) -> bool {
        self.0.should_retry(error) || self.1.should_retry(error)
    }
}

/// Runs operations under a retry policy
#[derive(Debug, Clone)]
pub struct Retrying<C> {
    policy: RetryPolicy,
    classifier: C,
}

impl<C> Retrying<C> {
    pub fn new(policy: RetryPolicy, classifier: C) -> Self {
        Self { policy, classifier }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `operation` until it succeeds, fails with an error the
    /// classifier rejects, or the policy runs out of attempts. The last error
    /// is returned as-is.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: RetryClassifier<E>,
        E: Display,
    {
        let mut attempt: u32 = 1;

        loop {
            tracing::debug!("Starting attempt #{attempt}");

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!("Operation succeeded on attempt #{attempt}");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !self.classifier.should_retry(&error) {
                tracing::debug!("Attempt #{attempt} failed with a non-retryable error: {error}");
                return Err(error);
            }

            if !self.policy.allows_retry_after(attempt) {
                tracing::warn!("Giving up after {attempt} attempts: {error}");
                return Err(error);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            tracing::debug!("Attempt #{attempt} failed, retrying in {delay:?}: {error}");
            tokio::time::sleep(delay).await;

            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn process_error(code: i32) -> Error {
        Error::ProcessExecution {
            command: "false".to_string(),
            exit_code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_zero_retries_rejected_at_construction() {
        let err = RetryPolicy::new(Duration::from_secs(1), 0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(RetryPolicy::new(Duration::from_secs(1), 1).is_ok());
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 5).unwrap();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));

        let policy = policy.backoff_rate(3.0).unwrap();
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(9));
    }

    #[test]
    fn test_invalid_backoff_rate_rejected() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 3).unwrap();
        for rate in [-0.5, 0.0, 0.5, f64::NAN, f64::INFINITY] {
            let err = policy.clone().backoff_rate(rate).unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)), "{rate} accepted");
        }

        let policy = policy.backoff_rate(1.0).unwrap();
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_capped_by_max_backoff() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 10)
            .unwrap()
            .max_backoff(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_delays() {
        let policy = RetryPolicy::new(Duration::from_millis(250), 3)
            .unwrap()
            .fixed();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(250));
    }

    #[test]
    fn test_random_delays_stay_within_bound() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 10)
            .unwrap()
            .wait_random()
            .max_backoff(Duration::from_secs(3));
        for attempt in 1..8 {
            let bound = Duration::from_secs_f64(2f64.powi(attempt as i32 - 1).min(3.0));
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= bound, "{delay:?} > {bound:?}");
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default().infinite();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::MAX);
        assert!(policy.allows_retry_after(u32::MAX));
    }

    #[test]
    fn test_exit_code_classifier() {
        let classifier = RetryIfExitCode::new([1, 2]);
        assert!(classifier.should_retry(&process_error(1)));
        assert!(classifier.should_retry(&process_error(2)));
        assert!(!classifier.should_retry(&process_error(3)));
        assert!(!classifier.should_retry(&Error::InvalidConfig("x".to_string())));
    }

    #[test]
    fn test_composed_classifier() {
        let classifier =
            RetryIfExitCode::new([255]).or(RetryIfKind::new([ErrorKind::AcquireTimeout]));
        assert!(classifier.should_retry(&process_error(255)));
        assert!(classifier.should_retry(&Error::AcquireTimeout {
            endpoint: "filer".to_string(),
            waited: Duration::from_secs(1),
        }));
        assert!(!classifier.should_retry(&process_error(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_is_attempted_exactly_retries_times() {
        let retrying = Retrying::new(RetryPolicy::new(Duration::from_secs(1), 3).unwrap(), RetryAll);
        let start = Instant::now();
        let mut calls = 0;

        let result: Result<(), Error> = retrying
            .run(|| {
                calls += 1;
                async { Err(process_error(1)) }
            })
            .await;

        assert_eq!(calls, 3);
        assert_eq!(result.unwrap_err().exit_code(), Some(1));
        // 1s after the first failure, 2s after the second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_matching_exit_code_is_not_retried() {
        let retrying = Retrying::new(
            RetryPolicy::new(Duration::from_secs(1), 5).unwrap(),
            RetryIfExitCode::new([1, 2]),
        );
        let start = Instant::now();
        let mut calls = 0;

        let result: Result<(), Error> = retrying
            .run(|| {
                calls += 1;
                async { Err(process_error(3)) }
            })
            .await;

        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().exit_code(), Some(3));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_exit_code_retried_up_to_bound() {
        let retrying = Retrying::new(
            RetryPolicy::new(Duration::from_secs(1), 4).unwrap(),
            RetryIfExitCode::new([1, 2]),
        );
        let mut calls = 0;

        let result: Result<(), Error> = retrying
            .run(|| {
                calls += 1;
                async { Err(process_error(1)) }
            })
            .await;

        assert_eq!(calls, 4);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let retrying = Retrying::new(RetryPolicy::new(Duration::from_secs(1), 5).unwrap(), RetryAll);
        let mut calls = 0;

        let result: Result<&str, Error> = retrying
            .run(|| {
                calls += 1;
                let outcome = if calls < 3 { Err(process_error(1)) } else { Ok("done") };
                async move { outcome }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_classifier_with_foreign_error_type() {
        let retrying = Retrying::new(
            RetryPolicy::new(Duration::from_millis(10), 3).unwrap(),
            |e: &std::io::Error| e.kind() == std::io::ErrorKind::TimedOut,
        );
        let mut calls = 0;

        let result: Result<(), std::io::Error> = retrying
            .run(|| {
                calls += 1;
                async { Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied)) }
            })
            .await;

        assert_eq!(calls, 1);
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::PermissionDenied
        );
    }
}
