//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use feed_resilience::config::ServiceConfig;
use feed_resilience::http::HttpServer;
use feed_resilience::resilience::clock::ManualClock;

/// Defaults with a small limiter and the admin surface on.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.rate_limit.limiter.base_limit = 3;
    config.rate_limit.limiter.window_secs = 60;
    config.rate_limit.limiter.posture.enabled = false;
    config.admin.enabled = true;
    config.admin.api_key = "test-admin-key".to_string();
    config
}

/// Server driven by a manual clock.
pub fn test_server(config: ServiceConfig) -> (HttpServer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let server = HttpServer::with_clock(config, clock.clone());
    (server, clock)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_from(uri: &str, client: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", client)
        .body(Body::empty())
        .unwrap()
}

pub fn admin_get(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {key}"))
        .body(Body::empty())
        .unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}
