use crate::rate_limit::RateLimiter;
use crate::ResilienceError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that admits requests through a [`RateLimiter`].
///
/// `key` maps each request to the identity being limited (client IP, customer id, ...).
pub struct RateLimitLayer<L: ?Sized, K> {
    limiter: Arc<L>,
    key: Arc<K>,
}

impl<L: ?Sized, K> RateLimitLayer<L, K> {
    pub fn new(limiter: Arc<L>, key: K) -> Self {
        Self { limiter, key: Arc::new(key) }
    }
}

impl<L: ?Sized, K> Clone for RateLimitLayer<L, K> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), key: self.key.clone() }
    }
}

impl<L: ?Sized, K> std::fmt::Debug for RateLimitLayer<L, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLayer").finish_non_exhaustive()
    }
}

impl<S, L: ?Sized, K> Layer<S> for RateLimitLayer<L, K> {
    type Service = RateLimitService<S, L, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone(), key: self.key.clone() }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, L: ?Sized, K> {
    inner: S,
    limiter: Arc<L>,
    key: Arc<K>,
}

impl<S: Clone, L: ?Sized, K> Clone for RateLimitService<S, L, K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: self.limiter.clone(), key: self.key.clone() }
    }
}

impl<S: std::fmt::Debug, L: ?Sized, K> std::fmt::Debug for RateLimitService<S, L, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitService").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S, L, K, Req> Service<Req> for RateLimitService<S, L, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + ?Sized + 'static,
    K: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let key = (self.key)(&req);
        // Take the instance that was polled ready; leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = limiter.consume(&key).await;
            if !decision.allowed {
                return Err(ResilienceError::RateLimited { retry_after: decision.retry_after() });
            }
            inner.call(req).await.map_err(ResilienceError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::{RateLimitConfig, SlidingWindowLimiter};
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[tokio::test]
    async fn rejects_once_budget_is_spent() {
        let clock = ManualClock::at(0);
        let limiter = Arc::new(
            SlidingWindowLimiter::builder("checkout", RateLimitConfig::new(1, Duration::from_secs(60)))
                .clock(Arc::new(clock.clone()))
                .build()
                .unwrap(),
        );
        let layer = RateLimitLayer::new(limiter, |req: &(&'static str, u32)| req.0.to_string());
        let svc = ServiceBuilder::new()
            .layer(layer)
            .service(service_fn(|req: (&'static str, u32)| async move { Ok::<_, Infallible>(req.1) }));

        assert_eq!(svc.clone().oneshot(("10.0.0.1", 1)).await.unwrap(), 1);
        assert_eq!(svc.clone().oneshot(("10.0.0.2", 2)).await.unwrap(), 2);

        clock.advance(Duration::from_secs(15));
        let err = svc.clone().oneshot(("10.0.0.1", 3)).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after_secs(), Some(45));
    }
}
