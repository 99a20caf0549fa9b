//! Convenient re-exports for common storefront-shield types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    cache::{CacheOptions, Invalidated, SwrCache},
    clock::{Clock, SystemClock},
    config::ShieldConfig,
    invalidation::{InvalidationRequest, InvalidationService},
    jitter::Jitter,
    rate_limit::{Decision, RateLimitConfig, RateLimitLayer, RateLimiter, SlidingWindowLimiter},
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    shield::Shield,
    store::{DistributedStore, StoreError},
    timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT},
    upstream::{Call, UpstreamClient, UpstreamError},
    ResilienceError,
};
