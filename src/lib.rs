#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # storefront-shield
//!
//! Resilience layer between a storefront and its upstream commerce API: admit requests, serve
//! cached data, and call upstream without letting a cache or store outage break the request
//! path.
//!
//! ## Features
//!
//! - **Sliding-window rate limiting** with an atomic distributed backend and in-memory fallback
//! - **Stale-while-revalidate caching** over any async producer, mirrored to the distributed store
//! - **Upstream HTTP client** with per-attempt timeouts and retries for idempotent requests
//! - **Cache invalidation** behind a shared bearer secret
//! - **Retry, backoff, jitter and timeout policies** usable on their own
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use storefront_shield::{CacheOptions, RateLimiter, Shield, ShieldConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shield = Shield::builder(ShieldConfig::from_env()?).build()?;
//!
//!     let decision = shield.general().consume("203.0.113.7").await;
//!     if !decision.allowed {
//!         println!("429, Retry-After: {}", decision.retry_after_secs);
//!         return Ok(());
//!     }
//!
//!     let upstream = shield.upstream().clone();
//!     let products: serde_json::Value = shield
//!         .cache()
//!         .get_or_compute(
//!             "products:list",
//!             move || async move { upstream.get("/products").await },
//!             CacheOptions::from_secs(30, 120),
//!         )
//!         .await?;
//!     println!("{}", products);
//!
//!     shield.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod jitter;
pub mod prelude;
pub mod presets;
pub mod rate_limit;
pub mod retry;
pub mod shield;
pub mod sleeper;
pub mod store;
pub mod tasks;
pub mod timeout;
pub mod upstream;

// Re-exports
pub use backoff::Backoff;
pub use cache::{CacheEntry, CacheOptions, EntryState, SwrCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{ConfigError, ShieldConfig};
pub use error::ResilienceError;
pub use invalidation::{InvalidationError, InvalidationRequest, InvalidationResponse, InvalidationService};
pub use jitter::Jitter;
pub use rate_limit::{
    Decision, RateLimitConfig, RateLimitLayer, RateLimiter, SlidingWindowLimiter,
};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use shield::{Shield, ShieldBuilder, ShieldError};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{DistributedStore, StoreError};
pub use timeout::TimeoutPolicy;
pub use upstream::{Call, UpstreamClient, UpstreamError};
