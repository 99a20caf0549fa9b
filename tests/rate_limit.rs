mod common;

use common::{capture_logs, FailingStore, MemoryStore, ScriptedStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use storefront_shield::rate_limit::{Decision, RateLimitConfig, RateLimiter, SlidingWindowLimiter};
use storefront_shield::store::DistributedStore;
use storefront_shield::ManualClock;

fn limiter(
    prefix: &str,
    config: RateLimitConfig,
    store: Arc<dyn DistributedStore>,
    clock: &ManualClock,
) -> SlidingWindowLimiter {
    SlidingWindowLimiter::builder(prefix, config)
        .store(store)
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("valid limiter")
}

#[tokio::test]
async fn distributed_window_follows_sliding_semantics() {
    let store = MemoryStore::new();
    let clock = ManualClock::at(0);
    let limiter = limiter("general", RateLimitConfig::new(2, Duration::from_secs(10)), store.clone(), &clock);

    assert!(limiter.consume("k").await.allowed);
    clock.set(5_000);
    assert!(limiter.consume("k").await.allowed);
    clock.set(5_001);
    assert_eq!(limiter.consume("k").await, Decision::deny(5));
    clock.set(10_002);
    assert!(limiter.consume("k").await.allowed);

    assert_eq!(store.script_calls.load(Ordering::SeqCst), 4);
    assert_eq!(store.zset_len("rl:general:k"), 2);
    assert!(!limiter.is_degraded());
}

#[tokio::test]
async fn instances_sharing_a_store_share_the_budget() {
    let store = MemoryStore::new();
    let clock = ManualClock::at(1_000);
    let config = RateLimitConfig::new(3, Duration::from_secs(60));
    let process_a = limiter("checkout", config, store.clone(), &clock);
    let process_b = limiter("checkout", config, store.clone(), &clock);

    assert!(process_a.consume("1.2.3.4").await.allowed);
    assert!(process_b.consume("1.2.3.4").await.allowed);
    assert!(process_a.consume("1.2.3.4").await.allowed);
    assert!(!process_b.consume("1.2.3.4").await.allowed);
}

#[tokio::test]
async fn prefixes_keep_limiters_apart() {
    let store = MemoryStore::new();
    let clock = ManualClock::at(0);
    let auth = limiter("auth", RateLimitConfig::new(1, Duration::from_secs(900)), store.clone(), &clock);
    let general = limiter("general", RateLimitConfig::new(1, Duration::from_secs(60)), store.clone(), &clock);

    assert!(auth.consume("ip").await.allowed);
    assert!(!auth.consume("ip").await.allowed);
    assert!(general.consume("ip").await.allowed);
    assert_eq!(store.keys(), vec!["rl:auth:ip".to_string(), "rl:general:ip".to_string()]);
}

#[tokio::test]
async fn failing_store_falls_back_to_local_window() {
    let store = Arc::new(FailingStore::default());
    let clock = ManualClock::at(0);
    let limiter = limiter("auth", RateLimitConfig::new(2, Duration::from_secs(60)), store.clone(), &clock);

    assert!(limiter.consume("k").await.allowed);
    assert!(limiter.consume("k").await.allowed);
    let denied = limiter.consume("k").await;
    assert_eq!(denied, Decision::deny(60));
    assert!(limiter.is_degraded());
    assert_eq!(store.calls.load(Ordering::SeqCst), 3, "store is still tried on every call");
}

#[tokio::test]
async fn degradation_is_logged_once() {
    let (logs, _guard) = capture_logs();
    let limiter = limiter(
        "general",
        RateLimitConfig::new(100, Duration::from_secs(60)),
        Arc::new(FailingStore::default()),
        &ManualClock::at(0),
    );

    for _ in 0..5 {
        assert!(limiter.consume("k").await.allowed);
    }

    let output = logs.contents();
    assert_eq!(output.matches("falling back to in-memory windows").count(), 1, "logs: {}", output);
    assert!(output.contains("storefront_shield::rate_limit"));
}

#[tokio::test]
async fn unavailable_store_is_skipped() {
    let store = MemoryStore::new();
    store.unavailable.store(true, Ordering::SeqCst);
    let clock = ManualClock::at(0);
    let limiter = limiter("general", RateLimitConfig::new(1, Duration::from_secs(1)), store.clone(), &clock);

    assert!(limiter.consume("k").await.allowed);
    assert!(!limiter.consume("k").await.allowed);
    assert_eq!(store.script_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn script_rejection_rounds_retry_after_up() {
    let clock = ManualClock::at(0);
    let store = Arc::new(ScriptedStore(vec![0, 4_001]));
    let limiter = limiter("general", RateLimitConfig::new(1, Duration::from_secs(10)), store, &clock);

    assert_eq!(limiter.consume("k").await, Decision::deny(5));
}

#[tokio::test]
async fn malformed_script_reply_degrades() {
    let clock = ManualClock::at(0);
    let store = Arc::new(ScriptedStore(vec![7]));
    let limiter = limiter("general", RateLimitConfig::new(1, Duration::from_secs(10)), store, &clock);

    assert!(limiter.consume("k").await.allowed);
    assert!(limiter.is_degraded());
}

#[tokio::test]
async fn budget_holds_for_any_call_pattern_within_window() {
    for points in [1u32, 3, 10] {
        let clock = ManualClock::at(0);
        let limiter = SlidingWindowLimiter::builder("p", RateLimitConfig::new(points, Duration::from_secs(60)))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        let mut allowed = 0;
        for i in 0..(points * 2) {
            clock.set(u64::from(i) * 1_000);
            if limiter.consume("k").await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, points);
    }
}
