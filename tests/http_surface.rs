//! End-to-end checks of the HTTP surface.

mod common;

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get as get_route;
use axum::Router;
use common::*;
use feed_resilience::http::response::ApiError;
use feed_resilience::http::{AppState, HttpServer};
use feed_resilience::resilience::CircuitState;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

#[tokio::test]
async fn test_health() {
    let (server, _) = test_server(test_config());
    let response = server.router().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_request_id_generated_or_echoed() {
    let (server, _) = test_server(test_config());

    let response = server.router().oneshot(get("/health")).await.unwrap();
    let generated = response.headers()["x-request-id"].to_str().unwrap();
    assert_eq!(generated.len(), 36);

    let request = axum::http::Request::builder()
        .uri("/health")
        .header("x-request-id", "feed-sync-42")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = server.router().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "feed-sync-42");
}

#[tokio::test]
async fn test_rate_limited_per_client() {
    let mut config = test_config();
    config.rate_limit.trust_forwarded_for = true;
    let (server, _) = test_server(config);

    for remaining in ["2", "1", "0"] {
        let response = server
            .router()
            .oneshot(get_from("/api/ping", "198.51.100.4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
    }

    let response = server
        .router()
        .oneshot(get_from("/api/ping", "198.51.100.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "60");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(body_json(response).await["error"], "rate limit exceeded");

    // A different client has its own window.
    let response = server
        .router()
        .oneshot(get_from("/api/ping", "198.51.100.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_window_reopens_after_clock_advance() {
    let mut config = test_config();
    config.rate_limit.trust_forwarded_for = true;
    let (server, clock) = test_server(config);

    for _ in 0..3 {
        server
            .router()
            .oneshot(get_from("/api/ping", "198.51.100.4"))
            .await
            .unwrap();
    }
    clock.advance(Duration::from_secs(45));
    let response = server
        .router()
        .oneshot(get_from("/api/ping", "198.51.100.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "15");

    clock.advance(Duration::from_secs(15));
    let response = server
        .router()
        .oneshot(get_from("/api/ping", "198.51.100.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_is_not_rate_limited() {
    let (server, _) = test_server(test_config());
    for _ in 0..10 {
        let response = server.router().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn test_metrics_exposition() {
    let (server, _) = test_server(test_config());
    server.router().oneshot(get("/api/ping")).await.unwrap();

    let response = server.router().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = body_string(response).await;
    assert!(text.contains("ratelimit_admissions_total"));
    assert!(text.contains("path=\"/api/ping\""));
    assert!(text.contains("resilience_state"));
}

#[tokio::test]
async fn test_metrics_disabled() {
    let mut config = test_config();
    config.observability.metrics_enabled = false;
    let (server, _) = test_server(config);
    let response = server.router().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dependency_readiness() {
    // Room for every request below under the per-client limit.
    let mut config = test_config();
    config.rate_limit.limiter.base_limit = 100;
    let (server, clock) = test_server(config);

    let response = server
        .router()
        .oneshot(get("/api/dependencies"))
        .await
        .unwrap();
    let list = body_json(response).await;
    assert_eq!(list.as_array().unwrap().len(), 4);

    let response = server
        .router()
        .oneshot(get("/api/dependencies/database"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["state"], "closed");

    let breaker = server.state().registry.get("database").unwrap();
    for _ in 0..5 {
        let _ = breaker.execute(|| Err::<(), _>("connection refused"));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let response = server
        .router()
        .oneshot(get("/api/dependencies/database"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "30");

    clock.advance(Duration::from_secs(30));
    // Reads never move the breaker; it still reports open until a call is admitted.
    let response = server
        .router()
        .oneshot(get("/api/dependencies/database"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "1");
}

// A handler built on the library: protected calls surface through `?`.
async fn scrape(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    let scraper = state
        .registry
        .protect::<std::io::Error>("web_scraper")
        .ok_or_else(|| ApiError::not_found("unknown dependency 'web_scraper'"))?;
    let body = scraper
        .call(&CancellationToken::new(), || async {
            Ok::<_, std::io::Error>("scraped")
        })
        .await?;
    Ok(body)
}

#[tokio::test]
async fn test_protected_handler_maps_open_circuit_to_503() {
    let (server, _) = test_server(test_config());
    let app = Router::new()
        .route("/scrape", get_route(scrape))
        .with_state(server.state().clone());

    let response = app.clone().oneshot(get("/scrape")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "scraped");

    let breaker = server.state().registry.get("web_scraper").unwrap();
    while breaker.state() != CircuitState::Open {
        let _ = breaker.execute(|| Err::<(), _>("403 forbidden"));
    }

    let response = app.oneshot(get("/scrape")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "3600");
    let error = body_json(response).await["error"].as_str().unwrap().to_string();
    assert!(error.starts_with("web_scraper: dependency unavailable"), "{error}");
}

#[tokio::test]
async fn test_unknown_dependency() {
    let (server, _) = test_server(test_config());
    let response = server
        .router()
        .oneshot(get("/api/dependencies/mainframe"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_requires_key() {
    let (server, _) = test_server(test_config());

    let response = server.router().oneshot(get("/admin/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = server
        .router()
        .oneshot(admin_get("/admin/status", "wrong-key"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = server
        .router()
        .oneshot(admin_get("/admin/status", "test-admin-key"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["status"], "operational");
    assert_eq!(status["limiter"]["posture"], "closed");
}

#[tokio::test]
async fn test_admin_views() {
    let (server, _) = test_server(test_config());
    let breaker = server.state().registry.get("ai_provider").unwrap();
    for _ in 0..5 {
        let _ = breaker.execute(|| Err::<(), _>("quota exceeded"));
    }

    let response = server
        .router()
        .oneshot(admin_get("/admin/status", "test-admin-key"))
        .await
        .unwrap();
    let status = body_json(response).await;
    assert_eq!(status["status"], "degraded");
    assert_eq!(status["open_breakers"][0], "ai_provider");

    let response = server
        .router()
        .oneshot(admin_get("/admin/breakers/ai_provider", "test-admin-key"))
        .await
        .unwrap();
    let breaker = body_json(response).await;
    assert_eq!(breaker["state"], "open");
    assert_eq!(breaker["retry_after_secs"], 60.0);
    assert_eq!(breaker["failure_threshold"], 0.6);

    let response = server
        .router()
        .oneshot(admin_get("/admin/breakers/nope", "test-admin-key"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = server
        .router()
        .oneshot(admin_get("/admin/config", "test-admin-key"))
        .await
        .unwrap();
    let config = body_json(response).await;
    assert_eq!(config["admin"]["api_key"], "<redacted>");
    assert_eq!(config["rate_limit"]["limiter"]["base_limit"], 3);
}

#[tokio::test]
async fn test_admin_disabled() {
    let mut config = test_config();
    config.admin.enabled = false;
    let (server, _) = test_server(config);
    let response = server
        .router()
        .oneshot(admin_get("/admin/status", "test-admin-key"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_serves_reloads_and_shuts_down() {
    let mut config = test_config();
    config.timeouts.shutdown_grace_secs = 1;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(config.clone());
    let state = server.state().clone();
    let (updates, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(listener, rx, shutdown.clone()));

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "3");
    assert_eq!(response.text().await.unwrap(), "pong");

    config.rate_limit.limiter.base_limit = 50;
    updates.send(config).unwrap();
    for _ in 0..100 {
        if state.limiter.config().base_limit == 50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.limiter.config().base_limit, 50);

    let response = client
        .get(format!("http://{addr}/api/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-ratelimit-limit"], "50");
    drop(client);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server stops after shutdown")
        .unwrap()
        .unwrap();
}
