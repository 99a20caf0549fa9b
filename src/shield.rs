//! Process-wide resilience context.
//!
//! Built once at startup from [`ShieldConfig`] and passed to request handlers. Owns the three
//! storefront limiters, the response cache, the upstream client, the invalidation service, and
//! the background sweepers, which [`Shield::shutdown`] stops.

use crate::cache::{CacheOptions, SwrCache};
use crate::clock::{Clock, SystemClock};
use crate::config::ShieldConfig;
use crate::invalidation::InvalidationService;
use crate::presets::{AUTH_PREFIX, CHECKOUT_PREFIX, GENERAL_PREFIX, SWEEP_INTERVAL};
use crate::rate_limit::{RateLimitConfigError, SlidingWindowLimiter};
use crate::store::DistributedStore;
use crate::tasks::Shutdown;
use crate::upstream::{UpstreamBuildError, UpstreamClient};
use crate::{Sleeper, TokioSleeper};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ShieldError {
    #[error(transparent)]
    RateLimit(#[from] RateLimitConfigError),
    #[error(transparent)]
    Upstream(#[from] UpstreamBuildError),
}

pub struct ShieldBuilder {
    config: ShieldConfig,
    store: Option<Arc<dyn DistributedStore>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sweep_interval: Duration,
}

impl ShieldBuilder {
    /// Distributed store shared by the limiters and the cache.
    pub fn store(mut self, store: Arc<dyn DistributedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleeper used between upstream retries.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval = every;
        self
    }

    /// Build the context and start the sweepers. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Shield, ShieldError> {
        let limiter = |prefix: &str, settings: crate::config::LimitSettings| {
            let mut builder = SlidingWindowLimiter::builder(prefix, settings.to_rate_limit())
                .clock(self.clock.clone());
            if let Some(store) = &self.store {
                builder = builder.store(store.clone());
            }
            builder.build().map(Arc::new)
        };
        let general = limiter(GENERAL_PREFIX, self.config.rate_limit.general)?;
        let auth = limiter(AUTH_PREFIX, self.config.rate_limit.auth)?;
        let checkout = limiter(CHECKOUT_PREFIX, self.config.rate_limit.checkout)?;

        let mut cache = SwrCache::builder()
            .clock(self.clock.clone())
            .max_entries(self.config.cache.max_entries);
        if let Some(store) = &self.store {
            cache = cache.store(store.clone());
        }
        let cache = cache.build();

        let mut upstream = UpstreamClient::builder(self.config.upstream_url.clone())
            .timeout(self.config.upstream.timeout())
            .max_retries(self.config.upstream.max_retries)
            .sleeper(self.sleeper.clone());
        if let Some(key) = &self.config.upstream_publishable_key {
            upstream = upstream.publishable_key(key.clone());
        }
        let upstream = upstream.build()?;

        let invalidation = InvalidationService::new(cache.clone(), self.config.cache_secret.clone());
        if !invalidation.is_configured() {
            warn!(target: "storefront_shield::shield", "no cache secret configured, invalidation endpoint disabled");
        }

        let shutdown = Shutdown::new();
        let sweepers = vec![
            general.spawn_sweeper(self.sweep_interval, shutdown.signal()),
            auth.spawn_sweeper(self.sweep_interval, shutdown.signal()),
            checkout.spawn_sweeper(self.sweep_interval, shutdown.signal()),
            cache.spawn_sweeper(self.sweep_interval, shutdown.signal()),
        ];

        info!(
            target: "storefront_shield::shield",
            distributed = self.store.is_some(),
            upstream = %upstream.store_url(),
            "storefront shield ready"
        );

        Ok(Shield {
            general,
            auth,
            checkout,
            cache,
            cache_options: self.config.cache.options(),
            upstream,
            invalidation,
            store: self.store,
            shutdown,
            sweepers: Mutex::new(sweepers),
        })
    }
}

/// Long-lived handle over every resilience component.
#[derive(Debug)]
pub struct Shield {
    general: Arc<SlidingWindowLimiter>,
    auth: Arc<SlidingWindowLimiter>,
    checkout: Arc<SlidingWindowLimiter>,
    cache: SwrCache,
    cache_options: CacheOptions,
    upstream: UpstreamClient,
    invalidation: InvalidationService,
    store: Option<Arc<dyn DistributedStore>>,
    shutdown: Shutdown,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shield {
    pub fn builder(config: ShieldConfig) -> ShieldBuilder {
        ShieldBuilder {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    pub fn general(&self) -> &Arc<SlidingWindowLimiter> {
        &self.general
    }

    pub fn auth(&self) -> &Arc<SlidingWindowLimiter> {
        &self.auth
    }

    pub fn checkout(&self) -> &Arc<SlidingWindowLimiter> {
        &self.checkout
    }

    pub fn cache(&self) -> &SwrCache {
        &self.cache
    }

    /// Configured default freshness for call sites without their own.
    pub fn cache_options(&self) -> CacheOptions {
        self.cache_options
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub fn invalidation(&self) -> &InvalidationService {
        &self.invalidation
    }

    /// `false` when no distributed store is configured or it does not answer a ping.
    pub async fn store_healthy(&self) -> bool {
        match &self.store {
            Some(store) => match store.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(target: "storefront_shield::shield", error = %e, "distributed store health check failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Stop the sweepers and wait for in-flight cache refreshes.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let sweepers = std::mem::take(&mut *self.sweepers.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in sweepers {
            if let Err(e) = handle.await {
                warn!(target: "storefront_shield::shield", error = %e, "sweeper ended abnormally");
            }
        }
        self.cache.join_refreshes().await;
        info!(target: "storefront_shield::shield", "storefront shield stopped");
    }
}

impl Drop for Shield {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
