//! Startup configuration from environment variables.
//!
//! Nested keys use `__` as the separator:
//!
//! ```text
//! REDIS_URL=redis://localhost:6379
//! UPSTREAM_URL=http://localhost:9000
//! UPSTREAM_PUBLISHABLE_KEY=pk_...
//! CACHE_SECRET=...
//! RATE_LIMIT__AUTH__POINTS=10
//! RATE_LIMIT__AUTH__WINDOW_MS=900000
//! CACHE__TTL_SECS=30
//! CACHE__STALE_SECS=120
//! CACHE__MAX_ENTRIES=100
//! UPSTREAM__TIMEOUT_MS=15000
//! UPSTREAM__MAX_RETRIES=2
//! ```
//!
//! Anything missing takes the storefront defaults. Without `REDIS_URL` every component runs on
//! in-process state only.

use crate::cache::{CacheOptions, DEFAULT_MAX_ENTRIES};
use crate::presets;
use crate::rate_limit::RateLimitConfig;
use ::config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    /// Absent means permanent fallback mode.
    pub redis_url: Option<String>,
    pub upstream_url: String,
    pub upstream_publishable_key: Option<String>,
    /// Shared bearer secret for the invalidation endpoint.
    pub cache_secret: Option<String>,
    pub rate_limit: RateLimits,
    pub cache: CacheSettings,
    pub upstream: UpstreamSettings,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            upstream_url: "http://localhost:9000".to_string(),
            upstream_publishable_key: None,
            cache_secret: None,
            rate_limit: RateLimits::default(),
            cache: CacheSettings::default(),
            upstream: UpstreamSettings::default(),
        }
    }
}

/// One limiter budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    pub points: u32,
    pub window_ms: u64,
}

impl LimitSettings {
    pub fn to_rate_limit(self) -> RateLimitConfig {
        RateLimitConfig::new(self.points, Duration::from_millis(self.window_ms))
    }
}

impl From<RateLimitConfig> for LimitSettings {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            points: config.points,
            window_ms: u64::try_from(config.window.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Limiter budgets. Each of `POINTS` and `WINDOW_MS` may be set on its own; the other keeps the
/// limiter's preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RateLimitOverrides")]
pub struct RateLimits {
    pub general: LimitSettings,
    pub auth: LimitSettings,
    pub checkout: LimitSettings,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            general: presets::GENERAL.into(),
            auth: presets::AUTH.into(),
            checkout: presets::CHECKOUT.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LimitOverride {
    points: Option<u32>,
    window_ms: Option<u64>,
}

impl LimitOverride {
    fn over(self, preset: RateLimitConfig) -> LimitSettings {
        let base = LimitSettings::from(preset);
        LimitSettings {
            points: self.points.unwrap_or(base.points),
            window_ms: self.window_ms.unwrap_or(base.window_ms),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RateLimitOverrides {
    general: LimitOverride,
    auth: LimitOverride,
    checkout: LimitOverride,
}

impl From<RateLimitOverrides> for RateLimits {
    fn from(overrides: RateLimitOverrides) -> Self {
        Self {
            general: overrides.general.over(presets::GENERAL),
            auth: overrides.auth.over(presets::AUTH),
            checkout: overrides.checkout.over(presets::CHECKOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Default freshness for call sites that do not choose their own.
    pub ttl_secs: u64,
    pub stale_secs: u64,
    pub max_entries: usize,
}

impl CacheSettings {
    pub fn options(&self) -> CacheOptions {
        CacheOptions::from_secs(self.ttl_secs, self.stale_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = CacheOptions::default();
        Self {
            ttl_secs: defaults.ttl.as_secs(),
            stale_secs: defaults.stale.as_secs(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub timeout_ms: u64,
    pub max_retries: usize,
}

impl UpstreamSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            timeout_ms: u64::try_from(presets::UPSTREAM_TIMEOUT.as_millis()).unwrap_or(15_000),
            max_retries: presets::UPSTREAM_MAX_RETRIES,
        }
    }
}

impl ShieldConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::default())
    }

    /// Load from explicit `NAME=value` pairs instead of the process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::load(Environment::default().source(Some(vars)))
    }

    fn load(env: Environment) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(env.separator("__").try_parsing(true))
            .build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("general", self.rate_limit.general),
            ("auth", self.rate_limit.auth),
            ("checkout", self.rate_limit.checkout),
        ];
        for (name, limit) in limits {
            if limit.points == 0 || limit.window_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate limit {} needs non-zero points and window_ms",
                    name
                )));
            }
        }
        if self.upstream.timeout_ms == 0 {
            return Err(ConfigError::Invalid("upstream timeout_ms must be non-zero".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid("cache max_entries must be non-zero".into()));
        }
        if self.upstream_url.trim().is_empty() {
            return Err(ConfigError::Invalid("upstream_url must not be empty".into()));
        }
        Ok(())
    }
}
