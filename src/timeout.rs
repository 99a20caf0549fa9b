//! Per-attempt timeout.
//!
//! The wrapped future is dropped when the deadline passes, which cancels the in-flight work
//! (for HTTP calls this aborts the request).

use crate::ResilienceError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Upper bound accepted by [`TimeoutPolicy::new`] (1 day).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

/// Rejected timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("timeout must be non-zero and at most {max:?} (got {provided:?})")]
pub struct TimeoutError {
    pub provided: Duration,
    pub max: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy; zero and absurdly long durations are rejected.
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() || duration > MAX_TIMEOUT {
            return Err(TimeoutError { provided: duration, max: MAX_TIMEOUT });
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, E, Fut>(&self, operation: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation).await {
            Ok(result) => result,
            Err(_) => Err(ResilienceError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
