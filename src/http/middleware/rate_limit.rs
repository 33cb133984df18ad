//! Per-client rate limiting for the API routes.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use crate::http::request::RequestIdExt;
use crate::http::response::{insert_rate_headers, too_many_requests};
use crate::http::server::AppState;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Key a request by client address.
///
/// With `trust_forwarded_for`, the first `X-Forwarded-For` hop wins; otherwise
/// (or when the header is missing or empty) the peer IP is used.
pub fn client_key(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware function for per-client rate limiting.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = state.config.load();
    if !config.rate_limit.enabled {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer, config.rate_limit.trust_forwarded_for);
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_string());

    let decision = state.limiter.check_with_path(&key, &path);
    if !decision.allowed {
        tracing::warn!(
            request_id = request.request_id().unwrap_or("-"),
            client = %key,
            path = %path,
            limit = decision.limit,
            level = decision.level,
            retry_after = ?decision.retry_after,
            "Rate limit exceeded"
        );
        return too_many_requests(&decision);
    }

    let mut response = next.run(request).await;
    insert_rate_headers(response.headers_mut(), &decision);
    response
}
