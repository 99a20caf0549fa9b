//! Sliding-window limiter over a log of consumption timestamps.
//!
//! A key may consume `points` within any `window`. An entry exactly `window` old no longer
//! counts. When rejected, the caller is told how many whole seconds remain until the oldest
//! entry leaves the window.
//!
//! Against the distributed store the whole check-then-append runs as one atomic script over a
//! sorted set `rl:<prefix>:<key>`, so concurrent processes cannot both see "under budget" and
//! both write. If that path fails for any reason the limiter switches to an in-process window
//! for the same key space and logs the degradation once.

use super::{Decision, RateLimiter};
use crate::clock::{Clock, SystemClock};
use crate::store::{
    namespaced_key, AtomicScript, DistributedStore, LocalStore, StoreError, RATE_LIMIT_NAMESPACE,
};
use crate::tasks::ShutdownSignal;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// KEYS[1] = window key; ARGV = now ms, window ms, points, unique member.
/// Returns `{1, 0}` when admitted, `{0, retry_after_ms}` when rejected.
pub const SLIDING_WINDOW_SCRIPT: AtomicScript = AtomicScript::new(
    "sliding_window_consume",
    r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local points = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count >= points then
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  local retry_after = window
  if oldest[2] then
    retry_after = tonumber(oldest[2]) + window - now
  end
  return {0, retry_after}
end

redis.call('ZADD', key, now, ARGV[4])
redis.call('PEXPIRE', key, window)
return {1, 0}
"#,
);

/// Budget for one limiter: `points` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub points: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub const fn new(points: u32, window: Duration) -> Self {
        Self { points, window }
    }

    fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitConfigError {
    #[error("rate limit points must be greater than zero")]
    ZeroPoints,
    #[error("rate limit window must be at least one millisecond")]
    ZeroWindow,
}

/// Sliding-window rate limiter with a distributed backend and a local fallback.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    prefix: String,
    config: RateLimitConfig,
    store: Option<Arc<dyn DistributedStore>>,
    local: LocalStore<VecDeque<u64>>,
    clock: Arc<dyn Clock>,
    degraded: AtomicBool,
}

pub struct SlidingWindowLimiterBuilder {
    prefix: String,
    config: RateLimitConfig,
    store: Option<Arc<dyn DistributedStore>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiterBuilder {
    /// Keep windows in the distributed store while it is reachable.
    pub fn store(mut self, store: Arc<dyn DistributedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<SlidingWindowLimiter, RateLimitConfigError> {
        if self.config.points == 0 {
            return Err(RateLimitConfigError::ZeroPoints);
        }
        if self.config.window_millis() == 0 {
            return Err(RateLimitConfigError::ZeroWindow);
        }
        Ok(SlidingWindowLimiter {
            prefix: self.prefix,
            config: self.config,
            store: self.store,
            local: LocalStore::new(self.clock.clone()),
            clock: self.clock,
            degraded: AtomicBool::new(false),
        })
    }
}

impl SlidingWindowLimiter {
    /// `prefix` separates this limiter's key space from every other limiter's.
    pub fn builder(prefix: impl Into<String>, config: RateLimitConfig) -> SlidingWindowLimiterBuilder {
        SlidingWindowLimiterBuilder {
            prefix: prefix.into(),
            config,
            store: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Whether a distributed failure has been seen since construction.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Periodically drop local windows whose entries have all expired.
    pub fn spawn_sweeper(&self, every: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        self.local.spawn_sweeper(every, shutdown)
    }

    async fn consume_distributed(
        &self,
        store: &dyn DistributedStore,
        key: &str,
        now: u64,
    ) -> Result<Decision, StoreError> {
        if !store.is_available() {
            return Err(StoreError::Unavailable("store is not accepting operations".into()));
        }
        let window_key = namespaced_key(RATE_LIMIT_NAMESPACE, &[&self.prefix, key]);
        // Same-millisecond writers from different processes need distinct members.
        let member = format!("{}-{:016x}", now, rand::random::<u64>());
        let args = [
            now.to_string(),
            self.config.window_millis().to_string(),
            self.config.points.to_string(),
            member,
        ];
        let reply = store.run_atomic_script(&SLIDING_WINDOW_SCRIPT, &[window_key], &args).await?;
        match reply.as_slice() {
            [1, ..] => Ok(Decision::allow()),
            [0, retry_after_ms, ..] => {
                let millis = u64::try_from(*retry_after_ms).unwrap_or(0);
                Ok(Decision::deny(millis.div_ceil(1000).max(1)))
            }
            other => Err(StoreError::Reply(format!("sliding window script returned {:?}", other))),
        }
    }

    fn consume_local(&self, key: &str, now: u64) -> Decision {
        let window = self.config.window_millis();
        let points = self.config.points as usize;
        self.local.update(key, |current| {
            let mut log = current.unwrap_or_default();
            while log.front().is_some_and(|&t| now.saturating_sub(t) >= window) {
                log.pop_front();
            }

            let decision = if log.len() >= points {
                let oldest = log.front().copied().unwrap_or(now);
                let wait = oldest.saturating_add(window).saturating_sub(now);
                Decision::deny(wait.div_ceil(1000).max(1))
            } else {
                let stamp = log.back().map_or(now, |&last| last.max(now));
                log.push_back(stamp);
                Decision::allow()
            };

            let next = match log.back() {
                Some(&newest) => {
                    let ttl = newest.saturating_add(window).saturating_sub(now);
                    Some((log, Duration::from_millis(ttl)))
                }
                None => None,
            };
            (next, decision)
        })
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn consume(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();
        if let Some(store) = &self.store {
            match self.consume_distributed(store.as_ref(), key, now).await {
                Ok(decision) => {
                    debug!(
                        target: "storefront_shield::rate_limit",
                        limiter = %self.prefix,
                        allowed = decision.allowed,
                        "distributed decision"
                    );
                    return decision;
                }
                Err(e) => {
                    if !self.degraded.swap(true, Ordering::Relaxed) {
                        warn!(
                            target: "storefront_shield::rate_limit",
                            limiter = %self.prefix,
                            error = %e,
                            "distributed rate limiting unavailable, falling back to in-memory windows"
                        );
                    }
                }
            }
        }
        self.consume_local(key, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(clock: &ManualClock, points: u32, window: Duration) -> SlidingWindowLimiter {
        SlidingWindowLimiter::builder("test", RateLimitConfig::new(points, window))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn two_points_per_ten_seconds() {
        let clock = ManualClock::at(0);
        let limiter = limiter(&clock, 2, Duration::from_secs(10));

        assert!(limiter.consume("k").await.allowed);
        clock.set(5_000);
        assert!(limiter.consume("k").await.allowed);
        clock.set(5_001);
        assert_eq!(limiter.consume("k").await, Decision::deny(5));
        clock.set(10_002);
        assert!(limiter.consume("k").await.allowed, "entry from t=0 has left the window");
    }

    #[tokio::test]
    async fn entry_exactly_one_window_old_is_expired() {
        let clock = ManualClock::at(1_000);
        let limiter = limiter(&clock, 1, Duration::from_secs(1));

        assert!(limiter.consume("k").await.allowed);
        clock.set(1_999);
        assert_eq!(limiter.consume("k").await, Decision::deny(1));
        clock.set(2_000);
        assert!(limiter.consume("k").await.allowed);
    }

    #[tokio::test]
    async fn rejected_calls_do_not_consume() {
        let clock = ManualClock::at(0);
        let limiter = limiter(&clock, 1, Duration::from_secs(10));

        assert!(limiter.consume("k").await.allowed);
        for t in [1_000, 2_000, 3_000] {
            clock.set(t);
            assert!(!limiter.consume("k").await.allowed);
        }
        clock.set(10_000);
        assert!(limiter.consume("k").await.allowed);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let clock = ManualClock::at(0);
        let limiter = limiter(&clock, 3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.consume("a").await.allowed);
        }
        assert!(!limiter.consume("a").await.allowed);
        assert!(limiter.consume("b").await.allowed);
    }

    #[tokio::test]
    async fn window_expires_from_local_store() {
        let clock = ManualClock::at(0);
        let limiter = limiter(&clock, 5, Duration::from_secs(60));
        limiter.consume("a").await;
        assert_eq!(limiter.local.len(), 1);

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.local.sweep(), 1);
    }

    #[test]
    fn invalid_budgets_are_rejected() {
        let zero_points = SlidingWindowLimiter::builder("x", RateLimitConfig::new(0, Duration::from_secs(1)));
        assert_eq!(zero_points.build().unwrap_err(), RateLimitConfigError::ZeroPoints);

        let zero_window = SlidingWindowLimiter::builder("x", RateLimitConfig::new(1, Duration::from_micros(10)));
        assert_eq!(zero_window.build().unwrap_err(), RateLimitConfigError::ZeroWindow);
    }
}
