//! HTTP surface for `storefront-shield` cache invalidation (companion crate).
//!
//! - [`router`]: the storefront side, `POST /api/internal/cache-invalidate`.
//! - [`InvalidationClient`]: the commerce backend side, called after catalog writes.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use storefront_shield::invalidation::{InvalidationError, InvalidationRequest, InvalidationService};

mod client;

pub use client::{InvalidationClient, InvalidationOutcome, INVALIDATION_TIMEOUT};

pub const INVALIDATE_PATH: &str = "/api/internal/cache-invalidate";

/// Router serving [`INVALIDATE_PATH`]; merge it into the storefront's app.
pub fn router(service: InvalidationService) -> Router {
    Router::new().route(INVALIDATE_PATH, post(invalidate_handler)).with_state(service)
}

/// Reasons an invalidation request is turned away.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("Cache invalidation not configured")]
    NotConfigured,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("patterns must be a string array")]
    InvalidPatterns,
}

impl From<InvalidationError> for Rejection {
    fn from(err: InvalidationError) -> Self {
        match err {
            InvalidationError::NotConfigured => Self::NotConfigured,
            InvalidationError::Unauthorized => Self::Unauthorized,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = match self {
            Rejection::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Rejection::Unauthorized => StatusCode::UNAUTHORIZED,
            Rejection::InvalidJson | Rejection::InvalidPatterns => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn invalidate_handler(
    State(service): State<InvalidationService>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Rejection> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    service.authorize(authorization)?;

    let request = parse_request(&body)?;
    let response = service.invalidate(request).await;
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// `{"patterns": [string, ...]}`; anything else is rejected.
fn parse_request(body: &[u8]) -> Result<InvalidationRequest, Rejection> {
    let value: Value = serde_json::from_slice(body).map_err(|_| Rejection::InvalidJson)?;
    let patterns = value
        .get("patterns")
        .and_then(Value::as_array)
        .ok_or(Rejection::InvalidPatterns)?
        .iter()
        .map(|p| p.as_str().map(str::to_owned).ok_or(Rejection::InvalidPatterns))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(InvalidationRequest { patterns })
}
