pub mod admin;
pub mod public;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use std::convert::Infallible;

pub const SESSION_HEADER: &str = "x-session-token";

/// The caller's session token, if any. Read from `X-Session-Token` or
/// `Authorization: Session <token>`; absence is left for the engine to judge.
#[derive(Debug, Clone, Default)]
pub struct SessionToken(pub Option<String>);

impl SessionToken {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }

    fn from_headers(headers: &HeaderMap) -> Self {
        let direct = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let bearer = || {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().strip_prefix("Session "))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        SessionToken(direct.or_else(bearer).map(String::from))
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for SessionToken {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

/// GET /metrics
pub async fn metrics() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}
