//! Compile-time prelude coverage test.
use std::sync::Arc;
use std::time::Duration;
use storefront_shield::prelude::*;
use tower::{service_fn, ServiceExt};
use tower_layer::Layer;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let _backoff = Backoff::exponential(Duration::from_millis(500));
    let _jitter = Jitter::None;
    let _timeout = TimeoutPolicy::new(Duration::from_secs(15)).expect("valid timeout");
    let _options = CacheOptions::from_secs(30, 120);
    let _config = ShieldConfig::default();

    let limiter = Arc::new(
        SlidingWindowLimiter::builder("general", RateLimitConfig::new(1, Duration::from_secs(60)))
            .build()
            .expect("valid limiter"),
    );
    let layer = RateLimitLayer::new(limiter, |req: &&'static str| req.to_string());
    let svc = layer.layer(service_fn(|_req: &'static str| async { Ok::<_, std::io::Error>("ok") }));

    assert_eq!(svc.clone().oneshot("203.0.113.7").await.expect("first call admitted"), "ok");
    let err = svc.oneshot("203.0.113.7").await.unwrap_err();
    assert!(matches!(err, ResilienceError::RateLimited { .. }));
}
