//! Error types shared by the policies.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;
/// Unified error type returned by the retry, timeout and rate-limit policies.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The attempt exceeded its timeout.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The rate limiter rejected the call; the caller may try again after `retry_after`.
    RateLimited { retry_after: Duration },
    /// Every allowed attempt failed with a retryable error.
    RetryExhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// The wrapped operation failed.
    Inner(E),
}
impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited; retry after {}s", retry_after.as_secs())
            }
            Self::RetryExhausted { attempts, failures } => match failures.last() {
                Some(last) => {
                    write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
                }
                None => write!(f, "retry exhausted after {} attempts; no recorded failures", attempts),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}
impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}
impl<E> ResilienceError<E> {
    /// Build `RetryExhausted`, keeping only the most recent `MAX_RETRY_FAILURES` failures.
    pub fn retry_exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let skip = failures.len().saturating_sub(MAX_RETRY_FAILURES);
        let trimmed: Vec<E> = failures.into_iter().skip(skip).collect();
        ResilienceError::RetryExhausted { attempts, failures: Arc::new(trimmed) }
    }
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }
    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Recorded failures for RetryExhausted, oldest first.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
    /// Seconds a rate-limited caller should wait, rounded up; suitable for `Retry-After`.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs();
                Some(if retry_after.subsec_nanos() > 0 { secs + 1 } else { secs })
            }
            _ => None,
        }
    }
}
