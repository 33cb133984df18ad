//! Error responses.
//!
//! # Responsibilities
//! - Map dependency failures to 503 Service Unavailable
//! - Render admission denials as 429 Too Many Requests with rate headers
//!
//! # Design Decisions
//! - Bodies are small JSON objects: `{"error": "..."}`
//! - `Retry-After` is whole seconds, rounded up, never 0

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::resilience::circuit_breaker::Rejection;
use crate::resilience::dependency::DependencyError;
use crate::security::rate_limit::Decision;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// `Retry-After` seconds: rounded up, at least 1.
pub fn retry_after_secs(delay: Duration) -> u64 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    secs.max(1)
}

/// Error returned by API handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: rejection.to_string(),
            retry_after: rejection.retry_after,
        }
    }
}

impl<E> From<DependencyError<E>> for ApiError {
    fn from(err: DependencyError<E>) -> Self {
        tracing::warn!(operation = %err.operation(), error = %err, "Dependency call failed");
        let retry_after = match &err {
            DependencyError::CircuitOpen { rejection, .. } => rejection.retry_after,
            _ => None,
        };
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: err.to_string(),
            retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, Json(serde_json::json!({ "error": self.message }))).into_response();
        if let Some(delay) = self.retry_after {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(delay)),
            );
        }
        response
    }
}

/// Attach `X-RateLimit-Limit` / `X-RateLimit-Remaining`.
pub fn insert_rate_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(
        HeaderName::from_static(X_RATELIMIT_LIMIT),
        HeaderValue::from(decision.limit),
    );
    headers.insert(
        HeaderName::from_static(X_RATELIMIT_REMAINING),
        HeaderValue::from(decision.remaining),
    );
}

/// 429 for a denied decision.
pub fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = retry_after_secs(decision.retry_after);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "error": "rate limit exceeded",
            "retry_after_secs": retry_after,
        })),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
    insert_rate_headers(headers, decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;

    #[test]
    fn test_retry_after_rounding() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(2)), 2);
        assert_eq!(retry_after_secs(Duration::from_millis(2001)), 3);
    }

    #[test]
    fn test_too_many_requests_headers() {
        let decision = Decision {
            allowed: false,
            retry_after: Duration::from_millis(1500),
            limit: 60,
            remaining: 0,
            level: 0,
        };
        let response = too_many_requests(&decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers["retry-after"], "2");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "60");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
    }

    #[test]
    fn test_open_circuit_maps_to_503() {
        let err: DependencyError<std::io::Error> = DependencyError::CircuitOpen {
            operation: "ai_provider".into(),
            attempts: 1,
            rejection: Rejection {
                breaker: "ai_provider".into(),
                state: CircuitState::Open,
                retry_after: Some(Duration::from_secs(42)),
            },
        };
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "42");
    }

    #[test]
    fn test_exhausted_maps_to_503() {
        let err = DependencyError::Failed {
            operation: "feed_fetcher".to_string(),
            attempts: 3,
            source: std::io::Error::other("connection reset"),
        };
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get("retry-after").is_none());
    }
}
