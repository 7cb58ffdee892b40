//! Retry policy, predicates and the retry loop.
//!
//! [`RetryExecutor`] drives one logical call: it runs an attempt under its own timeout,
//! classifies the failure, and either sleeps for the next backoff delay or gives up and
//! returns the last error unchanged.

use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// How many times to retry and how long to wait in between.
///
/// Delays start at `initial_delay` and double after every retryable failure, capped at
/// `max_delay`.
///
/// # Examples
///
/// ```
/// use callguard::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_retries: 2,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_millis(400),
///     ..RetryPolicy::default()
/// };
/// assert_eq!(policy.backoff_after(Duration::from_millis(300)), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: usize,

    /// The delay before the first retry.
    pub initial_delay: Duration,

    /// The maximum delay between retries.
    pub max_delay: Duration,

    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,

    /// Wait as long as a 429's `Retry-After` (or reset header) asks instead of the backoff.
    pub respect_retry_after: bool,

    /// Upper bound on a header-requested wait.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: false,
            respect_retry_after: true,
            max_retry_after: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// The delay that follows `current` in the backoff schedule.
    pub fn backoff_after(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Per-call retry bookkeeping, owned by a single run of the retry loop.
#[derive(Debug)]
pub struct AttemptState {
    /// The current attempt, starting at 1.
    pub attempt: usize,
    /// The backoff delay to use after the next retryable failure.
    pub next_delay: Duration,
    /// The error of the previous attempt.
    pub last_error: Option<Error>,
}

impl AttemptState {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            next_delay: policy.initial_delay.min(policy.max_delay),
            last_error: None,
        }
    }
}

/// Trait for determining whether a failed request should be retried.
///
/// # Examples
///
/// ```
/// use callguard::{Error, RetryPredicate};
///
/// struct RetryOnlyServerErrors;
///
/// impl RetryPredicate for RetryOnlyServerErrors {
///     fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
///         matches!(error, Error::ServerError { .. })
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Returns `true` to retry after `error` on the given (1-indexed) attempt.
    fn should_retry(&self, error: &Error, attempt: usize) -> bool;
}

/// Retry every error that [`Error::is_retryable`] accepts.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnRetryable;

impl RetryPredicate for RetryOnRetryable {
    fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
        error.is_retryable()
    }
}

/// Reported to the caller of [`RetryExecutor::execute`] after every failed attempt.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    /// The error of the failed attempt.
    pub error: &'a Error,
    /// The failed attempt, starting at 1.
    pub attempt: usize,
    /// The wait before the next attempt, or `None` when the error is final.
    pub delay: Option<Duration>,
}

/// A value produced by the retry loop, with the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    /// The successful value.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: usize,
}

/// Runs attempts until one succeeds, the error is not retryable, or retries run out.
pub struct RetryExecutor {
    policy: RetryPolicy,
    predicate: Box<dyn RetryPredicate>,
    attempt_timeout: Option<Duration>,
    overall_timeout: Option<Duration>,
}

impl RetryExecutor {
    /// Creates an executor that classifies errors with [`RetryOnRetryable`].
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            predicate: Box::new(RetryOnRetryable),
            attempt_timeout: None,
            overall_timeout: None,
        }
    }

    /// Replaces the retry predicate.
    pub fn with_predicate(mut self, predicate: Box<dyn RetryPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// Bounds each attempt. An attempt that runs over is aborted and fails with
    /// [`Error::Timeout`].
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Bounds the whole call across attempts and backoff sleeps.
    pub fn with_overall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.overall_timeout = timeout;
        self
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `attempt_fn` until it succeeds or the failure is final.
    ///
    /// `attempt_fn` receives the 1-indexed attempt number. `on_failure` observes every failed
    /// attempt along with the decision taken. The error returned after the last attempt is the
    /// one that attempt produced.
    pub async fn execute<T, F, Fut, O>(
        &self,
        mut attempt_fn: F,
        mut on_failure: O,
    ) -> Result<Attempted<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnMut(RetryEvent<'_>),
    {
        let started = Instant::now();
        let mut state = AttemptState::new(&self.policy);

        loop {
            state.attempt += 1;

            let outcome = match self.attempt_budget(started) {
                Some(budget) if budget.is_zero() => Err(Error::Timeout),
                Some(budget) => tokio::time::timeout(budget, attempt_fn(state.attempt))
                    .await
                    .unwrap_or(Err(Error::Timeout)),
                None => attempt_fn(state.attempt).await,
            };

            let error = match outcome {
                Ok(value) => {
                    if let Some(previous) = &state.last_error {
                        tracing::info!(
                            attempts = state.attempt,
                            previous_error = %previous,
                            "Request succeeded after retry"
                        );
                    }
                    return Ok(Attempted {
                        value,
                        attempts: state.attempt,
                    });
                }
                Err(error) => error,
            };

            let delay = self.next_delay(&error, &mut state, started);
            on_failure(RetryEvent {
                error: &error,
                attempt: state.attempt,
                delay,
            });

            let Some(delay) = delay else {
                return Err(error);
            };

            tracing::info!(
                delay_ms = delay.as_millis(),
                attempt = state.attempt,
                error = %error,
                "Retrying request after delay"
            );
            state.last_error = Some(error);
            tokio::time::sleep(delay).await;
        }
    }

    /// Time allowed for the next attempt: the per-attempt timeout clamped to what is left of
    /// the overall deadline.
    fn attempt_budget(&self, started: Instant) -> Option<Duration> {
        let remaining = self
            .overall_timeout
            .map(|overall| overall.saturating_sub(started.elapsed()));

        match (self.attempt_timeout, remaining) {
            (Some(attempt), Some(remaining)) => Some(attempt.min(remaining)),
            (attempt, remaining) => attempt.or(remaining),
        }
    }

    /// Decides whether to retry after `error`, advancing the backoff schedule if so.
    fn next_delay(
        &self,
        error: &Error,
        state: &mut AttemptState,
        started: Instant,
    ) -> Option<Duration> {
        if state.attempt > self.policy.max_retries {
            return None;
        }
        if !self.predicate.should_retry(error, state.attempt) {
            return None;
        }

        let backoff = state.next_delay;
        state.next_delay = self.policy.backoff_after(backoff);

        let delay = if self.policy.respect_retry_after {
            match error.rate_limit_delay(self.policy.max_retry_after) {
                Some(requested) => {
                    tracing::info!(
                        rate_limit_delay_ms = requested.as_millis(),
                        attempt = state.attempt,
                        "Rate limited - honoring upstream wait"
                    );
                    requested
                }
                None => self.policy.jittered(backoff),
            }
        } else {
            self.policy.jittered(backoff)
        };

        if let Some(overall) = self.overall_timeout {
            if started.elapsed().saturating_add(delay) >= overall {
                tracing::warn!(
                    attempt = state.attempt,
                    "Overall deadline reached - giving up"
                );
                return None;
            }
        }

        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server_error() -> Error {
        Error::ServerError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            raw_response: "boom".to_string(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    fn policy(max_retries: usize, initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(5, 100, 1000);
        let mut delay = policy.initial_delay;
        let mut schedule = vec![delay];
        for _ in 0..5 {
            delay = policy.backoff_after(delay);
            schedule.push(delay);
        }

        let expected: Vec<_> = [100, 200, 400, 800, 1000, 1000]
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        assert_eq!(schedule, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_server_error_exhausts_retries() {
        let executor = RetryExecutor::new(policy(4, 100, 400));
        let calls = AtomicUsize::new(0);
        let mut delays = Vec::new();

        let result: Result<Attempted<()>> = executor
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(server_error()) }
                },
                |event| delays.push(event.delay),
            )
            .await;

        assert!(matches!(result, Err(Error::ServerError { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let retried: Vec<_> = delays.iter().flatten().copied().collect();
        assert_eq!(retried.len(), 4);
        assert!(retried.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(retried.iter().all(|d| *d <= Duration::from_millis(400)));
        assert_eq!(delays.last(), Some(&None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_attempted_once() {
        let executor = RetryExecutor::new(policy(3, 10, 100));
        let calls = AtomicUsize::new(0);

        let result: Result<Attempted<()>> = executor
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(Error::ClientError {
                            status: StatusCode::NOT_FOUND,
                            raw_response: String::new(),
                            body: None,
                            headers: HeaderMap::new(),
                        })
                    }
                },
                |_| {},
            )
            .await;

        assert_eq!(result.unwrap_err().status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let executor = RetryExecutor::new(policy(2, 100, 400));
        let started = Instant::now();

        let result = executor
            .execute(
                |attempt| async move {
                    if attempt < 3 {
                        Err(server_error())
                    } else {
                        Ok(attempt)
                    }
                },
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(result.value, 3);
        assert_eq!(result.attempts, 3);
        // 100ms then 200ms of backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_is_retried() {
        let executor =
            RetryExecutor::new(policy(1, 10, 10)).with_attempt_timeout(Duration::from_millis(50));
        let mut timeouts = 0;

        let result = executor
            .execute(
                |attempt| async move {
                    if attempt == 1 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok(attempt)
                },
                |event| {
                    if event.error.is_timeout() {
                        timeouts += 1;
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result.value, 2);
        assert_eq!(timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let executor = RetryExecutor::new(policy(1, 10, 10));
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("2"));
        let rate_limited = Error::from_status(
            StatusCode::TOO_MANY_REQUESTS,
            String::new(),
            None,
            headers,
        );
        let mut delays = Vec::new();

        let _: Result<Attempted<()>> = executor
            .execute(
                |_| {
                    let error = rate_limited.clone();
                    async move { Err(error) }
                },
                |event| delays.push(event.delay),
            )
            .await;

        assert_eq!(delays, vec![Some(Duration::from_secs(2)), None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_bounds_the_call() {
        let executor = RetryExecutor::new(policy(10, 100, 100))
            .with_overall_timeout(Some(Duration::from_millis(250)));
        let started = Instant::now();
        let calls = AtomicUsize::new(0);

        let result: Result<Attempted<()>> = executor
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(server_error()) }
                },
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(Error::ServerError { .. })));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_retry_after_past_deadline_gives_up() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_retry_after: Duration::MAX,
            ..policy(3, 10, 10)
        })
        .with_overall_timeout(Some(Duration::from_secs(1)));
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("18446744073709551615"));
        let rate_limited = Error::from_status(
            StatusCode::TOO_MANY_REQUESTS,
            String::new(),
            None,
            headers,
        );
        let mut delays = Vec::new();

        let result: Result<Attempted<()>> = executor
            .execute(
                |_| {
                    let error = rate_limited.clone();
                    async move { Err(error) }
                },
                |event| delays.push(event.delay),
            )
            .await;

        assert!(matches!(result, Err(Error::RateLimited { .. })));
        assert_eq!(delays, vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let executor = RetryExecutor::new(policy(0, 10, 10));
        let calls = AtomicUsize::new(0);

        let result: Result<Attempted<()>> = executor
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::Timeout) }
                },
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(3, 100, 1000)
        };
        for _ in 0..100 {
            let delay = policy.jittered(Duration::from_millis(200));
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }
}
