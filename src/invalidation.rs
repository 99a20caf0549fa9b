//! Authenticated cache invalidation.
//!
//! The commerce backend calls this after catalog writes with a shared bearer secret. The HTTP
//! surface lives in `storefront-shield-http`; this module holds the decisions it makes.

use crate::cache::SwrCache;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidationError {
    /// No shared secret configured, so the endpoint is switched off.
    #[error("cache invalidation is not configured")]
    NotConfigured,
    #[error("missing or invalid bearer token")]
    Unauthorized,
}

/// Body of an invalidation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRequest {
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationResponse {
    pub invalidated: Vec<String>,
}

#[derive(Clone)]
pub struct InvalidationService {
    cache: SwrCache,
    secret: Option<String>,
}

impl std::fmt::Debug for InvalidationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationService")
            .field("configured", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

impl InvalidationService {
    /// An empty secret counts as unconfigured.
    pub fn new(cache: SwrCache, secret: Option<String>) -> Self {
        Self { cache, secret: secret.filter(|s| !s.is_empty()) }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Check an `Authorization` header value against `Bearer <secret>`.
    pub fn authorize(&self, authorization: Option<&str>) -> Result<(), InvalidationError> {
        let secret = self.secret.as_deref().ok_or(InvalidationError::NotConfigured)?;
        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(InvalidationError::Unauthorized)?;
        if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
            Ok(())
        } else {
            warn!(target: "storefront_shield::invalidation", "rejected invalidation request with a bad token");
            Err(InvalidationError::Unauthorized)
        }
    }

    /// Invalidate every pattern and echo them back.
    pub async fn invalidate(&self, request: InvalidationRequest) -> InvalidationResponse {
        for pattern in &request.patterns {
            self.cache.invalidate(pattern).await;
        }
        info!(target: "storefront_shield::invalidation", patterns = ?request.patterns, "invalidation request served");
        InvalidationResponse { invalidated: request.patterns }
    }

    /// [`authorize`](Self::authorize) then [`invalidate`](Self::invalidate).
    pub async fn handle(
        &self,
        authorization: Option<&str>,
        request: InvalidationRequest,
    ) -> Result<InvalidationResponse, InvalidationError> {
        self.authorize(authorization)?;
        Ok(self.invalidate(request).await)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
