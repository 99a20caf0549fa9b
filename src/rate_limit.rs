//! Rate limiting primitives.
//!
//! - [`RateLimiter`]: the core trait, one `consume` per admitted action.
//! - [`SlidingWindowLimiter`]: timestamp-log sliding window, executed as an atomic script on the
//!   distributed store and falling back to an in-process window when the store fails.
//! - [`RateLimitLayer`]: tower middleware that asks a limiter before calling the inner service.
//!
//! Limiters never fail: infrastructure problems degrade to local state instead of surfacing to
//! the request path.

use std::time::Duration;

pub mod middleware;
pub mod sliding_window;

pub use middleware::{RateLimitLayer, RateLimitService};
pub use sliding_window::{RateLimitConfig, RateLimitConfigError, SlidingWindowLimiter};

/// Outcome of one consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Whole seconds until a point frees up; `0` when allowed. Suitable for `Retry-After`.
    pub retry_after_secs: u64,
}

impl Decision {
    pub const fn allow() -> Self {
        Self { allowed: true, retry_after_secs: 0 }
    }

    pub const fn deny(retry_after_secs: u64) -> Self {
        Self { allowed: false, retry_after_secs }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

/// Core interface for rate limiting logic.
///
/// Decouples the middleware and the request handlers from the algorithm and from where its
/// state lives (memory or the distributed store).
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one point for `key`.
    async fn consume(&self, key: &str) -> Decision;
}

#[async_trait::async_trait]
impl<L> RateLimiter for std::sync::Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn consume(&self, key: &str) -> Decision {
        (**self).consume(key).await
    }
}
