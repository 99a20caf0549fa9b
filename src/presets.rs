//! Production presets for the storefront.
//!
//! ## Available Presets
//!
//! - [`GENERAL`]: all storefront traffic, 100 requests per minute per client.
//! - [`AUTH`]: login, registration and password reset, 10 attempts per 15 minutes.
//! - [`CHECKOUT`]: cart completion and payment sessions, 20 per minute.
//! - [`upstream_retry`]: retry schedule for idempotent calls to the commerce API.
//!
//! Each limiter preset has its own key prefix, so exhausting one never affects another.

use crate::rate_limit::{RateLimitConfig, RateLimitConfigError, SlidingWindowLimiter};
use crate::retry::BuildError;
use crate::{Backoff, Jitter, RetryPolicy, Sleeper};
use std::sync::Arc;
use std::time::Duration;

pub const GENERAL: RateLimitConfig = RateLimitConfig::new(100, Duration::from_secs(60));
pub const AUTH: RateLimitConfig = RateLimitConfig::new(10, Duration::from_secs(15 * 60));
pub const CHECKOUT: RateLimitConfig = RateLimitConfig::new(20, Duration::from_secs(60));

pub const GENERAL_PREFIX: &str = "general";
pub const AUTH_PREFIX: &str = "auth";
pub const CHECKOUT_PREFIX: &str = "checkout";

/// Retries after the first upstream attempt.
pub const UPSTREAM_MAX_RETRIES: usize = 2;
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);
pub const UPSTREAM_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Local limiter windows and cache entries are swept on this interval.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// General-traffic limiter with an in-process store only.
pub fn general_limiter() -> Result<SlidingWindowLimiter, RateLimitConfigError> {
    SlidingWindowLimiter::builder(GENERAL_PREFIX, GENERAL).build()
}

pub fn auth_limiter() -> Result<SlidingWindowLimiter, RateLimitConfigError> {
    SlidingWindowLimiter::builder(AUTH_PREFIX, AUTH).build()
}

pub fn checkout_limiter() -> Result<SlidingWindowLimiter, RateLimitConfigError> {
    SlidingWindowLimiter::builder(CHECKOUT_PREFIX, CHECKOUT).build()
}

/// `max_retries` retries after the first attempt, waiting `base * 2^n` plus up to `base / 2`.
pub fn upstream_retry<E>(
    max_retries: usize,
    base: Duration,
    sleeper: Arc<dyn Sleeper>,
    should_retry: impl Fn(&E) -> bool + Send + Sync + 'static,
) -> Result<RetryPolicy<E>, BuildError>
where
    E: std::error::Error + Send + Sync + 'static,
{
    RetryPolicy::builder()
        .max_attempts(max_retries + 1)
        .backoff(Backoff::exponential(base))
        .with_jitter(Jitter::half_of(base))
        .should_retry(should_retry)
        .with_shared_sleeper(sleeper)
        .build()
}
