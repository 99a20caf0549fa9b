//! Backoff schedules.
//!
//! Two schedules are used in this crate:
//! - exponential: upstream retries wait `base * 2^(n-1)` before retry `n`,
//! - linear: store reconnects wait `base * n` before reconnect attempt `n`, usually capped.
//!
//! Attempt index `0` is the initial call and never waits. Products that overflow saturate at
//! [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use storefront_shield::Backoff;
//!
//! let retry = Backoff::exponential(Duration::from_millis(500));
//! assert_eq!(retry.delay(1), Duration::from_millis(500));
//! assert_eq!(retry.delay(2), Duration::from_millis(1_000));
//!
//! let reconnect = Backoff::linear(Duration::from_millis(200))
//!     .with_max(Duration::from_secs(5))
//!     .unwrap();
//! assert_eq!(reconnect.delay(3), Duration::from_millis(600));
//! assert_eq!(reconnect.delay(40), Duration::from_secs(5));
//! ```

use std::time::Duration;

/// Ceiling applied when a computed delay would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Linear,
    Exponential,
}

/// A delay schedule indexed by attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    growth: Growth,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// `base * attempt`.
    pub fn linear(base: Duration) -> Self {
        Self { growth: Growth::Linear, base, max: None }
    }

    /// `base * 2^(attempt - 1)`.
    pub fn exponential(base: Duration) -> Self {
        Self { growth: Growth::Exponential, base, max: None }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Base delay the schedule grows from.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before `attempt` (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor: u128 = match self.growth {
            Growth::Linear => attempt as u128,
            Growth::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                2u128.saturating_pow(exponent)
            }
        };
        let nanos = self.base.as_nanos().saturating_mul(factor).min(MAX_BACKOFF.as_nanos());
        let raw = Duration::from_nanos(nanos as u64);
        match self.max {
            Some(max) => raw.min(max),
            None => raw,
        }
    }
}
