//! Redis backend for `storefront-shield` (companion crate).
//!
//! [`RedisStore`] implements [`DistributedStore`] over one multiplexed connection. The
//! connection is opened lazily and runs through a [`ConnectionGate`]: failed connects back off
//! linearly, and after too many in a row the store reports itself unavailable for the cooldown,
//! so callers fall straight through to their in-memory state instead of waiting on Redis.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storefront_shield::store::{
    AtomicScript, ConnectionGate, ConnectionState, DistributedStore, ReconnectPolicy, StoreError,
};
use tracing::debug;

/// How long a single connect attempt may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SCAN_BATCH: usize = 100;

#[derive(Clone)]
pub struct RedisStore {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    client: redis::Client,
    url: String,
    gate: ConnectionGate,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("RedisStore")
                .field("url", &inner.url)
                .field("state", &inner.gate.state())
                .field("client", &"<redis::Client>")
                .finish(),
            None => f.debug_struct("RedisStore").field("url", &"<disabled>").finish(),
        }
    }
}

impl RedisStore {
    /// Store for an optional URL; `None` or an empty string gives a permanently disabled store.
    ///
    /// # Errors
    /// Returns `Err` if the URL cannot be parsed as a Redis connection string.
    pub fn new(url: Option<&str>) -> Result<Self, StoreError> {
        match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => Self::open(url),
            None => Ok(Self::disabled()),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Store for `url` with the default reconnect policy. Does not connect yet.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Self::with_gate(url, ConnectionGate::new("redis", ReconnectPolicy::default()))
    }

    /// Store for `url` whose connection runs through `gate`.
    pub fn with_gate(url: &str, gate: ConnectionGate) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("invalid redis url {}: {}", sanitize_url(url), e)))?;
        Ok(Self {
            inner: Some(Arc::new(Inner {
                client,
                url: sanitize_url(url),
                gate,
                connection: Mutex::new(None),
            })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Current connection state; `None` when disabled.
    pub fn state(&self) -> Option<ConnectionState> {
        self.inner.as_ref().map(|inner| inner.gate.state())
    }

    fn inner(&self) -> Result<&Arc<Inner>, StoreError> {
        self.inner
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("redis is not configured".to_string()))
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let inner = self.inner()?;
        if let Some(conn) = inner.cached() {
            return Ok(conn);
        }

        // Dropping `attempt` at the await below (caller cancelled) is recorded as a failure.
        let attempt = inner.gate.begin_connect().map_err(StoreError::Unavailable)?;
        debug!(target: "storefront_shield::redis", url = %inner.url, "connecting");
        let outcome =
            tokio::time::timeout(CONNECT_TIMEOUT, inner.client.get_multiplexed_async_connection()).await;
        match outcome {
            Ok(Ok(conn)) => {
                *inner.slot() = Some(conn.clone());
                attempt.succeeded();
                Ok(conn)
            }
            Ok(Err(e)) => {
                attempt.failed(&e.to_string());
                Err(StoreError::Connection(e.to_string()))
            }
            Err(_) => {
                let reason = format!("connect timed out after {:?}", CONNECT_TIMEOUT);
                attempt.failed(&reason);
                Err(StoreError::Connection(reason))
            }
        }
    }

    /// Map a command error; broken connections are dropped so the next call reconnects.
    fn command_error(&self, err: RedisError) -> StoreError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            if let Some(inner) = &self.inner {
                inner.slot().take();
                inner.gate.connection_lost(&err.to_string());
            }
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

impl Inner {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<MultiplexedConnection>> {
        self.connection.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn cached(&self) -> Option<MultiplexedConnection> {
        self.slot().clone()
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    fn is_available(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| inner.gate.is_accepting())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await.map_err(|e| self.command_error(e))?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl_secs).await.map_err(|e| self.command_error(e))?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(removed)
    }

    async fn scan_keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.command_error(e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn run_atomic_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.connection().await?;
        let lua = redis::Script::new(script.source());
        let mut invocation = lua.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await.map_err(|e| {
            match self.command_error(e) {
                StoreError::Command(msg) => StoreError::Script(format!("{}: {}", script.name(), msg)),
                other => other,
            }
        })?;
        Ok(reply)
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(())
    }
}

/// Redis URL safe for logs: the password is masked.
pub fn sanitize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid_url".to_string(),
    }
}
