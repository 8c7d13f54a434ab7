use axum::{
    extract::{Request, State},
    http::{HeaderName, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::config::ApiConfig;

/// Shared-secret check on a configurable header.
#[derive(Clone)]
pub struct ApiKeyGuard {
    header: HeaderName,
    expected: Option<Arc<str>>,
}

impl ApiKeyGuard {
    /// `None` when `API_KEY` is unset, which config only allows with `API_KEY_REQUIRED=false`.
    pub fn from_config(config: &ApiConfig) -> Self {
        let header = HeaderName::from_bytes(config.api_key_header.to_ascii_lowercase().as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("x-api-key"));
        Self {
            header,
            expected: config.api_key.as_deref().map(Arc::from),
        }
    }

    pub fn is_open(&self) -> bool {
        self.expected.is_none()
    }

    fn accepts(&self, presented: Option<&str>) -> bool {
        match (&self.expected, presented) {
            (None, _) => true,
            (Some(expected), Some(presented)) => constant_time_eq(expected.as_bytes(), presented.as_bytes()),
            (Some(_), None) => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn api_key_middleware(State(guard): State<ApiKeyGuard>, req: Request, next: Next) -> Response {
    let presented = req.headers().get(&guard.header).and_then(|h| h.to_str().ok());
    if !guard.accepts(presented) {
        tracing::debug!("Rejected {} {}: missing or wrong API key", req.method(), req.uri().path());
        let body = serde_json::json!({"error": "Unauthorized"});
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }
    next.run(req).await
}
