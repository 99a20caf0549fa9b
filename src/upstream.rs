//! HTTP client for the upstream commerce API.
//!
//! Every attempt runs under a hard timeout that drops the in-flight request. Only idempotent
//! methods (`GET`, `HEAD`) are retried, and only for transient failures: `502`, `503`, `504`,
//! timeouts and connection errors. Everything else fails on the first attempt.

use crate::presets::{UPSTREAM_BACKOFF_BASE, UPSTREAM_MAX_RETRIES, UPSTREAM_TIMEOUT};
use crate::retry::BuildError;
use crate::timeout::TimeoutError;
use crate::{presets, ResilienceError, RetryPolicy, Sleeper, TimeoutPolicy, TokioSleeper};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const PUBLISHABLE_KEY_HEADER: &str = "x-publishable-api-key";
pub const CART_ID_HEADER: &str = "x-cart-id";

/// Final failure of an upstream call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Non-2xx response; `message` is the upstream's own error message when it sent one.
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream connection failed: {0}")]
    Connection(String),
    #[error("upstream response could not be decoded: {0}")]
    Decode(String),
    #[error("invalid upstream request: {0}")]
    Request(String),
}

impl UpstreamError {
    /// Failures worth retrying on an idempotent request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 502..=504),
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Decode(_) | Self::Request(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_builder() {
            Self::Request(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Error message for a non-2xx response body.
pub fn error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| format!("Request failed with status {}", status))
}

/// One upstream request. Paths are relative to `<base>/store`.
#[derive(Debug, Clone)]
pub struct Call {
    method: Method,
    path: String,
    body: Option<Value>,
    headers: Vec<(String, String)>,
    cart_id: Option<String>,
}

impl Call {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), body: None, headers: Vec::new(), cart_id: None }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Extra header; overrides a default header of the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send the `x-cart-id` header.
    pub fn cart(mut self, cart_id: impl Into<String>) -> Self {
        self.cart_id = Some(cart_id.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn is_idempotent(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamBuildError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Retry(#[from] BuildError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct UpstreamClientBuilder {
    base_url: String,
    publishable_key: Option<String>,
    timeout: Duration,
    max_retries: usize,
    backoff_base: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl UpstreamClientBuilder {
    pub fn publishable_key(mut self, key: impl Into<String>) -> Self {
        self.publishable_key = Some(key.into());
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retries after the first attempt for idempotent requests.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Result<UpstreamClient, UpstreamBuildError> {
        let timeout = TimeoutPolicy::new(self.timeout)?;
        let retry = presets::upstream_retry(
            self.max_retries,
            self.backoff_base,
            self.sleeper,
            UpstreamError::is_transient,
        )?;
        let http = reqwest::Client::builder().build()?;
        Ok(UpstreamClient {
            http,
            store_url: format!("{}/store", self.base_url.trim_end_matches('/')),
            publishable_key: self.publishable_key,
            timeout,
            retry,
        })
    }
}

/// Resilient client for the commerce API's store routes.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    store_url: String,
    publishable_key: Option<String>,
    timeout: TimeoutPolicy,
    retry: RetryPolicy<UpstreamError>,
}

impl UpstreamClient {
    pub fn builder(base_url: impl Into<String>) -> UpstreamClientBuilder {
        UpstreamClientBuilder {
            base_url: base_url.into(),
            publishable_key: None,
            timeout: UPSTREAM_TIMEOUT,
            max_retries: UPSTREAM_MAX_RETRIES,
            backoff_base: UPSTREAM_BACKOFF_BASE,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn store_url(&self) -> &str {
        &self.store_url
    }

    /// `call(method, path, body, headers)` without the builder.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Result<Value, UpstreamError> {
        let mut call = Call::new(method, path);
        call.body = body;
        for (name, value) in headers {
            call = call.header(*name, *value);
        }
        self.send(call).await
    }

    pub async fn get(&self, path: &str) -> Result<Value, UpstreamError> {
        self.send(Call::get(path)).await
    }

    /// Issue `call`, retrying transient failures of idempotent requests.
    pub async fn send(&self, call: Call) -> Result<Value, UpstreamError> {
        let url = self.url(&call.path);
        let headers = self.headers(&call)?;

        let op = {
            let this = self;
            let call = &call;
            let url = &url;
            let headers = &headers;
            move || async move {
                let attempt = this.timeout.execute(async {
                    this.attempt(call, url, headers).await.map_err(ResilienceError::Inner)
                });
                match attempt.await {
                    Err(ResilienceError::Timeout { timeout, .. }) => {
                        Err(ResilienceError::Inner(UpstreamError::Timeout(timeout)))
                    }
                    other => other,
                }
            }
        };

        let result = if call.is_idempotent() {
            let path = call.path.as_str();
            self.retry
                .execute_observed(op, |retry| {
                    warn!(
                        target: "storefront_shield::upstream",
                        path,
                        error = %retry.error,
                        attempt = retry.attempt + 1,
                        delay_ms = retry.delay.as_millis() as u64,
                        "upstream request failed, retrying"
                    );
                })
                .await
        } else {
            op().await
        };

        result.map_err(|e| self.final_error(e))
    }

    fn final_error(&self, err: ResilienceError<UpstreamError>) -> UpstreamError {
        match err {
            ResilienceError::Inner(e) => e,
            ResilienceError::RetryExhausted { failures, .. } => failures
                .last()
                .cloned()
                .unwrap_or_else(|| UpstreamError::Connection("retries exhausted".into())),
            ResilienceError::Timeout { timeout, .. } => UpstreamError::Timeout(timeout),
            ResilienceError::RateLimited { retry_after } => UpstreamError::Status {
                status: 429,
                message: format!("rate limited; retry after {}s", retry_after.as_secs()),
            },
        }
    }

    async fn attempt(&self, call: &Call, url: &str, headers: &HeaderMap) -> Result<Value, UpstreamError> {
        let mut request = self.http.request(call.method.clone(), url).headers(headers.clone());
        if let Some(body) = &call.body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;
        debug!(target: "storefront_shield::upstream", method = %call.method, path = %call.path, status = status.as_u16(), "upstream response");

        if !status.is_success() {
            let status = status.as_u16();
            return Err(UpstreamError::Status { status, message: error_message(status, &body) });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    fn classify(&self, err: reqwest::Error) -> UpstreamError {
        match UpstreamError::from(err) {
            UpstreamError::Timeout(_) => UpstreamError::Timeout(self.timeout.duration()),
            other => other,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.store_url, path)
        } else {
            format!("{}/{}", self.store_url, path)
        }
    }

    fn headers(&self, call: &Call) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.publishable_key {
            headers.insert(PUBLISHABLE_KEY_HEADER, header_value(key)?);
        }
        if let Some(cart_id) = &call.cart_id {
            headers.insert(CART_ID_HEADER, header_value(cart_id)?);
        }
        for (name, value) in &call.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| UpstreamError::Request(format!("header {:?}: {}", name, e)))?;
            headers.insert(name, header_value(value)?);
        }
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, UpstreamError> {
    HeaderValue::from_str(value).map_err(|e| UpstreamError::Request(e.to_string()))
}
