//! Retry policy for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only `ResilienceError::Inner(E)` values are eligible for retry; other variants return
//!   immediately.
//! - `should_retry` decides whether an `Inner` error is transient. Non-transient errors are
//!   returned as `Inner` on the attempt that produced them, without delay.
//! - Before retry `n` the policy sleeps `backoff.delay(n)` plus jitter.
//!
//! Invariants:
//! - Attempts never exceed `max_attempts`.
//! - The sleeper is invoked exactly once between consecutive attempts.
//!
//! ```rust
//! use std::time::Duration;
//! use storefront_shield::{Backoff, InstantSleeper, Jitter, RetryPolicy, ResilienceError};
//!
//! #[derive(Debug)]
//! struct Flaky;
//! impl std::fmt::Display for Flaky { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "flaky") } }
//! impl std::error::Error for Flaky {}
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let policy = RetryPolicy::<Flaky>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(500)))
//!     .with_jitter(Jitter::half_of(Duration::from_millis(500)))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<Flaky>> =
//!     policy.execute(|| async { Err(ResilienceError::Inner(Flaky)) }).await;
//! assert!(result.unwrap_err().is_retry_exhausted());
//! # });
//! ```

use crate::error::MAX_RETRY_FAILURES;
use crate::{Backoff, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Details handed to a retry observer just before the policy sleeps.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 0-based index of the attempt that failed.
    pub attempt: usize,
    /// The transient error that attempt produced.
    pub error: &'a E,
    /// Delay before the next attempt.
    pub delay: Duration,
}

/// Retry policy combining backoff, jitter, predicate, and sleeper.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Total attempts, initial call included.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_observed(operation, |_| {}).await
    }

    /// Like [`execute`](Self::execute), calling `observer` before every retry sleep.
    pub async fn execute_observed<T, Fut, Op, Obs>(
        &self,
        mut operation: Op,
        mut observer: Obs,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
        Obs: FnMut(RetryAttempt<'_, E>) + Send,
    {
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut attempt = 0;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) => e,
                // Timeout and friends are already classified by the caller.
                Err(other) => return Err(other),
            };

            if !(self.should_retry)(&error) {
                return Err(ResilienceError::Inner(error));
            }

            if attempt + 1 >= self.max_attempts {
                failures.push_back(error);
                return Err(ResilienceError::retry_exhausted(
                    self.max_attempts,
                    failures.into_iter().collect(),
                ));
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt + 1));
            observer(RetryAttempt { attempt, error: &error, delay });

            failures.push_back(error);
            while failures.len() > MAX_RETRY_FAILURES {
                failures.pop_front();
            }

            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Three attempts, 500 ms exponential backoff, jitter up to 250 ms, retry everything.
    pub fn new() -> Self {
        let base = Duration::from_millis(500);
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(base),
            jitter: Jitter::half_of(base),
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate to decide if an `Inner` error is transient.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Share an existing sleeper.
    pub fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
