use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName};
use axum::middleware::Next;
use axum::response::Response;

use super::error::ApiError;
use super::AppState;

/// Shared-key check for protected routes.
#[derive(Debug, Clone)]
pub struct ApiKeyGate {
    header: HeaderName,
    key: Option<String>,
}

impl ApiKeyGate {
    /// A gate without a usable key rejects every request.
    pub fn new(header: &str, key: Option<&str>) -> Self {
        let header = HeaderName::from_bytes(header.as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("x-api-key"));
        Self {
            header,
            key: key.map(str::to_string),
        }
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn check(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.key else {
            return false;
        };
        headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|presented| constant_time_eq(presented.as_bytes(), expected.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.gate.check(request.headers()) {
        tracing::warn!(path = %request.uri().path(), "rejected request without valid API key");
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}
