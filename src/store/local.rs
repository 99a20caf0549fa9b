//! In-process key/value store with per-entry TTL.
//!
//! Used as the fallback when the distributed store is unavailable. Expired entries are dropped
//! lazily on access and periodically by [`LocalStore::spawn_sweeper`]. With a capacity set, the
//! least recently used entry is evicted on overflow.

use crate::clock::Clock;
use crate::tasks::ShutdownSignal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    expires_at: u64,
    last_used: u64,
}

#[derive(Debug)]
struct Slots<V> {
    map: HashMap<String, Slot<V>>,
    tick: u64,
}

impl<V> Slots<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

pub struct LocalStore<V> {
    inner: Arc<Mutex<Slots<V>>>,
    clock: Arc<dyn Clock>,
    capacity: Option<usize>,
}

impl<V> Clone for LocalStore<V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), clock: self.clock.clone(), capacity: self.capacity }
    }
}

impl<V> std::fmt::Debug for LocalStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<V> LocalStore<V> {
    fn lock(&self) -> MutexGuard<'_, Slots<V>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Entries currently held, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> LocalStore<V>
where
    V: Clone + Send + 'static,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots { map: HashMap::new(), tick: 0 })),
            clock,
            capacity: None,
        }
    }

    /// Bound the number of entries; the least recently used one is evicted on overflow.
    pub fn with_capacity(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self { capacity: Some(capacity.max(1)), ..Self::new(clock) }
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl)
    }

    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = self.expiry(ttl);
        let mut slots = self.lock();
        let last_used = slots.next_tick();
        slots.map.insert(key.into(), Slot { value, expires_at, last_used });
        self.evict_overflow(&mut slots);
    }

    fn evict_overflow(&self, slots: &mut Slots<V>) {
        let Some(capacity) = self.capacity else { return };
        while slots.map.len() > capacity {
            let oldest = slots
                .map
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    slots.map.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Current value, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut slots = self.lock();
        let tick = slots.next_tick();
        match slots.map.get_mut(key) {
            Some(slot) if now < slot.expires_at => {
                slot.last_used = tick;
                Some(slot.value.clone())
            }
            Some(_) => {
                slots.map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().map.remove(key).map(|slot| slot.value)
    }

    /// Remove every key the predicate accepts, returning how many were removed.
    pub fn remove_matching<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&str) -> bool,
    {
        let mut slots = self.lock();
        let before = slots.map.len();
        slots.map.retain(|key, _| !predicate(key));
        before - slots.map.len()
    }

    /// Read-modify-write under the store lock.
    ///
    /// `f` sees the live value (`None` if absent or expired) and returns the replacement with
    /// its TTL (`None` removes the key) together with a result for the caller.
    pub fn update<R, F>(&self, key: &str, f: F) -> R
    where
        F: FnOnce(Option<V>) -> (Option<(V, Duration)>, R),
    {
        let now = self.clock.now_millis();
        let mut slots = self.lock();
        let current = match slots.map.remove(key) {
            Some(slot) if now < slot.expires_at => Some(slot.value),
            _ => None,
        };
        let (next, result) = f(current);
        if let Some((value, ttl)) = next {
            let expires_at = self.expiry(ttl);
            let last_used = slots.next_tick();
            slots.map.insert(key.to_string(), Slot { value, expires_at, last_used });
            self.evict_overflow(&mut slots);
        }
        result
    }

    /// Drop expired entries, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut slots = self.lock();
        let before = slots.map.len();
        slots.map.retain(|_, slot| now < slot.expires_at);
        before - slots.map.len()
    }

    /// Sweep expired entries every `every` until `shutdown` fires.
    pub fn spawn_sweeper(&self, every: Duration, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            debug!(target: "storefront_shield::store", removed, "swept expired local entries");
                        }
                    }
                }
            }
        })
    }
}
