//! Storage backends shared by the rate limiter and the cache.
//!
//! - [`DistributedStore`]: the network key-value store (Redis in production, see the
//!   `storefront-shield-redis` crate). Every call can fail; callers catch and fall back.
//! - [`LocalStore`](local::LocalStore): the in-process fallback with TTL expiry.
//! - [`ConnectionGate`](connection::ConnectionGate): the reconnect/cooldown state machine a
//!   distributed adapter runs its connection through.

use async_trait::async_trait;
use std::time::Duration;

pub mod connection;
pub mod local;

pub use connection::{ConnectAttempt, ConnectionGate, ConnectionState, ReconnectPolicy};
pub use local::LocalStore;

/// Key namespace for rate-limit windows: `rl:<limiter prefix>:<key>`.
pub const RATE_LIMIT_NAMESPACE: &str = "rl";
/// Key namespace for cache entries: `cache:<key>`.
pub const CACHE_NAMESPACE: &str = "cache";

/// Failure talking to the distributed store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Not configured, or refusing work while the reconnect cooldown runs.
    #[error("distributed store unavailable: {0}")]
    Unavailable(String),
    #[error("distributed store connection failed: {0}")]
    Connection(String),
    #[error("atomic script failed: {0}")]
    Script(String),
    #[error("distributed store command failed: {0}")]
    Command(String),
    #[error("unexpected reply from distributed store: {0}")]
    Reply(String),
}

/// A store-side operation that must execute indivisibly (a Lua script on Redis).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicScript {
    name: &'static str,
    source: &'static str,
}

impl AtomicScript {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// Network key-value store with atomic scripted operations.
#[async_trait]
pub trait DistributedStore: Send + Sync + std::fmt::Debug {
    /// Whether the store is worth calling right now. `false` when unconfigured or while the
    /// adapter is cooling down after repeated connection failures.
    fn is_available(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Every key matching a glob pattern (`*`, `?`, `[...]`).
    async fn scan_keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Run `script` atomically; integer array replies only.
    async fn run_atomic_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>, StoreError>;

    /// Read and remove in one step (single-use tokens such as WebAuthn challenges).
    async fn get_and_delete(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// `<namespace>:<parts...>` joined with `:`.
pub fn namespaced_key(namespace: &str, parts: &[&str]) -> String {
    let mut key = String::from(namespace);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

/// Escape glob metacharacters so `literal` only matches itself inside a scan pattern.
pub fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Convert a TTL to whole seconds for `SETEX`, rounding up so entries never expire early.
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
