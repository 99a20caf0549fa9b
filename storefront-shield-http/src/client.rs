use crate::INVALIDATE_PATH;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

/// Deadline for one invalidation request.
pub const INVALIDATION_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened to an invalidation call. Failures are logged, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// Storefront URL or secret not configured.
    Skipped,
    Invalidated,
    Failed(String),
}

/// Backend-side caller of the storefront invalidation endpoint.
#[derive(Clone)]
pub struct InvalidationClient {
    http: reqwest::Client,
    target: Option<(String, String)>,
}

impl std::fmt::Debug for InvalidationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationClient")
            .field("endpoint", &self.target.as_ref().map(|(url, _)| url))
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

impl InvalidationClient {
    /// Client for `<storefront_url>/api/internal/cache-invalidate`. Without both a URL and a
    /// secret every call is skipped.
    pub fn new(storefront_url: Option<&str>, secret: Option<&str>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(INVALIDATION_TIMEOUT).build()?;
        let target = match (storefront_url, secret) {
            (Some(url), Some(secret)) if !url.is_empty() && !secret.is_empty() => Some((
                format!("{}{}", url.trim_end_matches('/'), INVALIDATE_PATH),
                secret.to_string(),
            )),
            _ => None,
        };
        Ok(Self { http, target })
    }

    pub fn is_configured(&self) -> bool {
        self.target.is_some()
    }

    /// Ask the storefront to drop every cache entry matching `patterns`.
    pub async fn invalidate(&self, patterns: &[String]) -> InvalidationOutcome {
        let Some((url, secret)) = &self.target else {
            return InvalidationOutcome::Skipped;
        };

        let sent = self
            .http
            .post(url)
            .bearer_auth(secret)
            .json(&json!({ "patterns": patterns }))
            .send()
            .await;

        let reason = match sent {
            Ok(response) if response.status().is_success() => {
                info!(target: "storefront_shield::http", ?patterns, "storefront cache invalidated");
                return InvalidationOutcome::Invalidated;
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                format!("HTTP {}: {}", status, text)
            }
            Err(e) => e.to_string(),
        };
        error!(target: "storefront_shield::http", ?patterns, error = %reason, "storefront cache invalidation failed");
        InvalidationOutcome::Failed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_url_and_secret() {
        assert!(!InvalidationClient::new(None, Some("s")).unwrap().is_configured());
        assert!(!InvalidationClient::new(Some("http://shop"), None).unwrap().is_configured());
        assert!(!InvalidationClient::new(Some("http://shop"), Some("")).unwrap().is_configured());

        let client = InvalidationClient::new(Some("http://shop/"), Some("s")).unwrap();
        assert!(client.is_configured());
        assert_eq!(
            client.target.as_ref().map(|(url, _)| url.as_str()),
            Some("http://shop/api/internal/cache-invalidate")
        );
    }

    #[tokio::test]
    async fn unconfigured_client_skips() {
        let client = InvalidationClient::new(None, None).unwrap();
        assert_eq!(client.invalidate(&["products".to_string()]).await, InvalidationOutcome::Skipped);
    }
}
