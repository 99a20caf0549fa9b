//! Stale-while-revalidate cache in front of arbitrary async producers.
//!
//! Each key cycles through three states relative to now:
//!
//! ```text
//! created_at ........ fresh_until ........ stale_until ........
//! |------- fresh -------|------- stale -------|---- expired ----
//! ```
//!
//! - fresh: served without calling the producer,
//! - stale: served immediately while one background refresh replaces the entry,
//! - expired or absent: the producer runs inline and its error, if any, reaches the caller.
//!
//! Entries live in a bounded local map and, when a distributed store is configured, are
//! mirrored under `cache:<key>` with a TTL covering the stale window. Lookups try the
//! distributed copy first so every process sees the latest refresh.

use crate::clock::{Clock, SystemClock};
use crate::store::{
    escape_glob, namespaced_key, ttl_secs, DistributedStore, LocalStore, StoreError,
    CACHE_NAMESPACE,
};
use crate::tasks::{ShutdownSignal, TaskTracker};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Local entries kept before the least recently used one is evicted.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// One cached producer result. Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: u64,
    pub fresh_until: u64,
    pub stale_until: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    Expired,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, now: u64, options: CacheOptions) -> Self {
        let fresh_until = now.saturating_add(millis(options.ttl));
        let stale_until = fresh_until.saturating_add(millis(options.stale));
        Self { data, created_at: now, fresh_until, stale_until }
    }

    pub fn state(&self, now: u64) -> EntryState {
        if now < self.fresh_until {
            EntryState::Fresh
        } else if now < self.stale_until {
            EntryState::Stale
        } else {
            EntryState::Expired
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Freshness settings for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub stale: Duration,
}

impl CacheOptions {
    pub const fn new(ttl: Duration, stale: Duration) -> Self {
        Self { ttl, stale }
    }

    pub const fn from_secs(ttl_secs: u64, stale_secs: u64) -> Self {
        Self::new(Duration::from_secs(ttl_secs), Duration::from_secs(stale_secs))
    }

    /// How long an entry is retained: fresh plus stale.
    pub fn retention(&self) -> Duration {
        self.ttl.saturating_add(self.stale)
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from_secs(30, 120)
    }
}

/// Entries removed by one [`SwrCache::invalidate`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invalidated {
    pub local: usize,
    pub distributed: usize,
}

#[derive(Debug)]
struct CacheInner {
    local: LocalStore<CacheEntry<Value>>,
    store: Option<Arc<dyn DistributedStore>>,
    clock: Arc<dyn Clock>,
    /// Keys with a refresh in flight, flagged once an invalidation supersedes the refresh.
    refreshing: Mutex<HashMap<String, bool>>,
    tasks: TaskTracker,
}

impl CacheInner {
    fn refreshing(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.refreshing.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn available_store(&self) -> Option<&dyn DistributedStore> {
        self.store.as_deref().filter(|s| s.is_available())
    }
}

/// Releases the per-key refresh claim however the refresh task ends.
struct RefreshClaim {
    inner: Arc<CacheInner>,
    key: String,
}

impl RefreshClaim {
    fn superseded(&self) -> bool {
        self.inner.refreshing().get(&self.key).copied().unwrap_or(false)
    }
}

impl Drop for RefreshClaim {
    fn drop(&mut self) {
        self.inner.refreshing().remove(&self.key);
    }
}

/// Stale-while-revalidate cache. Cloning is cheap and clones share state.
#[derive(Debug, Clone)]
pub struct SwrCache {
    inner: Arc<CacheInner>,
}

impl Default for SwrCache {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct SwrCacheBuilder {
    store: Option<Arc<dyn DistributedStore>>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
}

impl SwrCacheBuilder {
    pub fn store(mut self, store: Arc<dyn DistributedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn build(self) -> SwrCache {
        SwrCache {
            inner: Arc::new(CacheInner {
                local: LocalStore::with_capacity(self.clock.clone(), self.max_entries),
                store: self.store,
                clock: self.clock,
                refreshing: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
            }),
        }
    }
}

impl SwrCache {
    pub fn builder() -> SwrCacheBuilder {
        SwrCacheBuilder { store: None, clock: Arc::new(SystemClock), max_entries: DEFAULT_MAX_ENTRIES }
    }

    /// Return the cached value for `key`, computing it with `producer` when needed.
    ///
    /// Producer errors are returned only when there was nothing servable; a failed background
    /// refresh is logged and the stale value keeps being served.
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: CacheOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let now = self.inner.clock.now_millis();
        if let Some(entry) = self.lookup(key, now).await {
            let state = entry.state(now);
            match serde_json::from_value::<T>(entry.data) {
                Ok(value) => {
                    if state == EntryState::Stale {
                        self.spawn_refresh(key, producer, options);
                    }
                    debug!(target: "storefront_shield::cache", key, ?state, "cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(target: "storefront_shield::cache", key, error = %e, "cached value has an unexpected shape, recomputing");
                }
            }
        }

        debug!(target: "storefront_shield::cache", key, "cache miss");
        let value = producer().await?;
        let encoded = encode(key, &value);
        if let Some(data) = encoded {
            store_entry(&self.inner, key, data, options).await;
        }
        Ok(value)
    }

    async fn lookup(&self, key: &str, now: u64) -> Option<CacheEntry<Value>> {
        if let Some(store) = self.inner.available_store() {
            let remote_key = namespaced_key(CACHE_NAMESPACE, &[key]);
            match store.get(&remote_key).await {
                Ok(Some(raw)) => match serde_json::from_str::<CacheEntry<Value>>(&raw) {
                    Ok(entry) if entry.state(now) != EntryState::Expired => return Some(entry),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "storefront_shield::cache", key, error = %e, "ignoring undecodable distributed entry");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    debug!(target: "storefront_shield::cache", key, error = %e, "distributed read failed, using local entry");
                }
            }
        }
        self.inner.local.get(key).filter(|entry| entry.state(now) != EntryState::Expired)
    }

    fn spawn_refresh<T, F, Fut, E>(&self, key: &str, producer: F, options: CacheOptions)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        {
            let mut refreshing = self.inner.refreshing();
            if refreshing.contains_key(key) {
                debug!(target: "storefront_shield::cache", key, "refresh already in flight");
                return;
            }
            refreshing.insert(key.to_string(), false);
        }
        let claim = RefreshClaim { inner: self.inner.clone(), key: key.to_string() };
        self.inner.tasks.spawn(async move {
            match producer().await {
                Ok(value) => {
                    let encoded = encode(&claim.key, &value);
                    drop(value);
                    let Some(data) = encoded else { return };
                    if claim.superseded() {
                        debug!(target: "storefront_shield::cache", key = %claim.key, "key invalidated during refresh, dropping result");
                        return;
                    }
                    store_entry(&claim.inner, &claim.key, data, options).await;
                    debug!(target: "storefront_shield::cache", key = %claim.key, "background refresh stored");
                }
                Err(e) => {
                    error!(target: "storefront_shield::cache", key = %claim.key, error = %e, "background refresh failed, serving stale value");
                }
            }
            drop(claim);
        });
    }

    /// Remove every entry whose key contains `pattern` from both tiers.
    ///
    /// Distributed failures are logged and counted as zero removals. Refreshes already in flight
    /// for matching keys finish without writing their result.
    pub async fn invalidate(&self, pattern: &str) -> Invalidated {
        for (key, superseded) in self.inner.refreshing().iter_mut() {
            if key.contains(pattern) {
                *superseded = true;
            }
        }
        let local = self.inner.local.remove_matching(|key| key.contains(pattern));
        let distributed = match self.inner.available_store() {
            Some(store) => match invalidate_distributed(store, pattern).await {
                Ok(removed) => removed,
                Err(e) => {
                    error!(target: "storefront_shield::cache", pattern, error = %e, "distributed invalidation failed");
                    0
                }
            },
            None => 0,
        };
        info!(target: "storefront_shield::cache", pattern, local, distributed, "cache invalidated");
        Invalidated { local, distributed }
    }

    /// Entries held locally.
    pub fn local_len(&self) -> usize {
        self.inner.local.len()
    }

    /// Background refreshes currently in flight.
    pub fn pending_refreshes(&self) -> usize {
        self.inner.refreshing().len()
    }

    /// Wait for every background refresh spawned so far.
    pub async fn join_refreshes(&self) {
        self.inner.tasks.join_all().await;
    }

    /// Periodically drop local entries past their stale window.
    pub fn spawn_sweeper(&self, every: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        self.inner.local.spawn_sweeper(every, shutdown)
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(data) => Some(data),
        Err(e) => {
            error!(target: "storefront_shield::cache", key, error = %e, "value is not serializable, not caching");
            None
        }
    }
}

async fn store_entry(inner: &CacheInner, key: &str, data: Value, options: CacheOptions) {
    let entry = CacheEntry::new(data, inner.clock.now_millis(), options);
    let retention = options.retention();
    inner.local.insert(key, entry.clone(), retention);

    let Some(store) = inner.available_store() else { return };
    let expiry = ttl_secs(retention);
    if expiry == 0 {
        return;
    }
    let result = match serde_json::to_string(&entry) {
        Ok(raw) => store.set_with_expiry(&namespaced_key(CACHE_NAMESPACE, &[key]), &raw, expiry).await,
        Err(e) => Err(StoreError::Command(e.to_string())),
    };
    if let Err(e) = result {
        error!(target: "storefront_shield::cache", key, error = %e, "failed to write distributed entry");
    }
}

async fn invalidate_distributed(store: &dyn DistributedStore, pattern: &str) -> Result<usize, StoreError> {
    let glob = format!("{}:*{}*", CACHE_NAMESPACE, escape_glob(pattern));
    let prefix = format!("{}:", CACHE_NAMESPACE);
    let keys: Vec<String> = store
        .scan_keys_matching(&glob)
        .await?
        .into_iter()
        .filter(|k| k.strip_prefix(&prefix).is_some_and(|rest| rest.contains(pattern)))
        .collect();
    if keys.is_empty() {
        return Ok(0);
    }
    let removed = store.delete(&keys).await?;
    Ok(usize::try_from(removed).unwrap_or(usize::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn cache(clock: &ManualClock) -> SwrCache {
        SwrCache::builder().clock(Arc::new(clock.clone())).build()
    }

    fn counted(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> futures::future::Ready<Result<String, String>> + Send + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(value.to_string()))
        }
    }

    const OPTS: CacheOptions = CacheOptions::from_secs(30, 120);

    #[test]
    fn entry_states_follow_boundaries() {
        let entry = CacheEntry::new((), 1_000, OPTS);
        assert_eq!(entry.state(1_000), EntryState::Fresh);
        assert_eq!(entry.state(30_999), EntryState::Fresh);
        assert_eq!(entry.state(31_000), EntryState::Stale);
        assert_eq!(entry.state(150_999), EntryState::Stale);
        assert_eq!(entry.state(151_000), EntryState::Expired);
    }

    #[test]
    fn entry_serializes_with_camel_case_fields() {
        let entry = CacheEntry::new("v", 0, CacheOptions::from_secs(1, 2));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"data": "v", "createdAt": 0, "freshUntil": 1000, "staleUntil": 3000})
        );
    }

    #[tokio::test]
    async fn stale_value_is_served_while_refreshing() {
        let clock = ManualClock::at(0);
        let cache = cache(&clock);
        let calls = Arc::new(AtomicUsize::new(0));

        let v: String = cache.get_or_compute("k", counted(&calls, "v1"), OPTS).await.unwrap();
        assert_eq!(v, "v1");
        let v: String = cache.get_or_compute("k", counted(&calls, "unused"), OPTS).await.unwrap();
        assert_eq!(v, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "fresh hit never calls the producer");

        clock.set(31_000);
        let v: String = cache.get_or_compute("k", counted(&calls, "v2"), OPTS).await.unwrap();
        assert_eq!(v, "v1", "stale value is returned immediately");
        cache.join_refreshes().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        clock.set(32_000);
        let v: String = cache.get_or_compute("k", counted(&calls, "v3"), OPTS).await.unwrap();
        assert_eq!(v, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entry_blocks_on_producer() {
        let clock = ManualClock::at(0);
        let cache = cache(&clock);
        let calls = Arc::new(AtomicUsize::new(0));

        let _: String = cache.get_or_compute("k", counted(&calls, "v1"), OPTS).await.unwrap();
        clock.set(150_000);
        let v: String = cache.get_or_compute("k", counted(&calls, "v2"), OPTS).await.unwrap();
        assert_eq!(v, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.pending_refreshes(), 0);
    }

    #[tokio::test]
    async fn miss_propagates_producer_error() {
        let cache = cache(&ManualClock::at(0));
        let result: Result<String, String> =
            cache.get_or_compute("k", || async { Err("upstream down".to_string()) }, OPTS).await;
        assert_eq!(result.unwrap_err(), "upstream down");
        assert_eq!(cache.local_len(), 0, "failures are not cached");
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_value() {
        let clock = ManualClock::at(0);
        let cache = cache(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let _: String = cache.get_or_compute("k", counted(&calls, "v1"), OPTS).await.unwrap();

        clock.set(40_000);
        let v: String = cache
            .get_or_compute("k", || async { Err::<String, _>("boom".to_string()) }, OPTS)
            .await
            .unwrap();
        assert_eq!(v, "v1");
        cache.join_refreshes().await;

        let v: String = cache.get_or_compute("k", counted(&calls, "v2"), OPTS).await.unwrap();
        assert_eq!(v, "v1", "still stale, so the old value is served and another refresh starts");
        cache.join_refreshes().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_refresh_per_key_at_a_time() {
        let clock = ManualClock::at(0);
        let cache = cache(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let _: String = cache.get_or_compute("k", counted(&calls, "v1"), OPTS).await.unwrap();
        clock.set(31_000);

        let gate = Arc::new(Notify::new());
        let refreshes = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let gate = gate.clone();
            let refreshes = refreshes.clone();
            let v: String = cache
                .get_or_compute(
                    "k",
                    move || async move {
                        refreshes.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok::<_, String>("v2".to_string())
                    },
                    OPTS,
                )
                .await
                .unwrap();
            assert_eq!(v, "v1");
        }
        assert_eq!(cache.pending_refreshes(), 1);

        gate.notify_one();
        cache.join_refreshes().await;
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.pending_refreshes(), 0);
    }

    #[tokio::test]
    async fn refresh_finishing_after_invalidation_is_discarded() {
        let clock = ManualClock::at(0);
        let cache = cache(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let _: String = cache.get_or_compute("products:list", counted(&calls, "v1"), OPTS).await.unwrap();
        let _: String = cache.get_or_compute("regions", counted(&calls, "r1"), OPTS).await.unwrap();
        clock.set(31_000);

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        for (key, fresh) in [("products:list", "v2"), ("regions", "r2")] {
            let gate = gate.clone();
            let _: String = cache
                .get_or_compute(
                    key,
                    move || async move {
                        let _permit = gate.acquire().await;
                        Ok::<_, String>(fresh.to_string())
                    },
                    OPTS,
                )
                .await
                .unwrap();
        }
        assert_eq!(cache.pending_refreshes(), 2);

        cache.invalidate("products").await;
        gate.add_permits(2);
        cache.join_refreshes().await;
        assert_eq!(cache.pending_refreshes(), 0);

        let v: String = cache.get_or_compute("products:list", counted(&calls, "v3"), OPTS).await.unwrap();
        assert_eq!(v, "v3", "invalidated key is recomputed, not restored by the old refresh");
        let v: String = cache.get_or_compute("regions", counted(&calls, "unused"), OPTS).await.unwrap();
        assert_eq!(v, "r2", "unrelated refresh still lands");
    }

    #[tokio::test]
    async fn invalidate_removes_only_matching_keys() {
        let cache = cache(&ManualClock::at(0));
        let calls = Arc::new(AtomicUsize::new(0));
        for key in ["products:list", "products:handle:shirt", "regions"] {
            let _: String = cache.get_or_compute(key, counted(&calls, "x"), OPTS).await.unwrap();
        }

        let removed = cache.invalidate("products").await;
        assert_eq!(removed, Invalidated { local: 2, distributed: 0 });

        let _: String = cache.get_or_compute("regions", counted(&calls, "y"), OPTS).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3, "regions stayed cached");
        let v: String = cache.get_or_compute("products:list", counted(&calls, "z"), OPTS).await.unwrap();
        assert_eq!(v, "z");
    }
}
