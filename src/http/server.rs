//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the shared application state (limiter, breakers, metrics)
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, timeout, request ID, rate limiting)
//! - Serve until shutdown, applying hot config updates meanwhile
//! - Run the limiter observer for the lifetime of the server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::admin;
use crate::config::ServiceConfig;
use crate::http::middleware::rate_limit_middleware;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::http::response::ApiError;
use crate::observability::metrics::{NoopMetrics, PrometheusMetrics, SharedMetrics};
use crate::resilience::circuit_breaker::{CircuitState, Rejection};
use crate::resilience::clock::{SharedClock, SystemClock};
use crate::resilience::registry::DependencyRegistry;
use crate::security::rate_limit::RateLimiter;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<ServiceConfig>>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<DependencyRegistry>,
    pub metrics: SharedMetrics,
    /// Present when the `/metrics` endpoint is enabled.
    pub prometheus: Option<Arc<PrometheusMetrics>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServiceConfig, clock: SharedClock) -> Self {
        let prometheus = config
            .observability
            .metrics_enabled
            .then(PrometheusMetrics::shared);
        let metrics: SharedMetrics = match &prometheus {
            Some(p) => Arc::clone(p) as SharedMetrics,
            None => NoopMetrics::shared(),
        };

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.limiter.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let registry = Arc::new(DependencyRegistry::new(
            &config.breaker_configs(),
            config.retries.clone(),
            clock,
            metrics.clone(),
        ));

        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            limiter,
            registry,
            metrics,
            prometheus,
            started_at: Instant::now(),
        }
    }

    /// Apply a reloaded config. Limiter and admin settings take effect
    /// immediately; breaker changes need a restart.
    pub fn apply_config(&self, config: ServiceConfig) {
        let current = self.config.load();
        if current.breaker_configs() != config.breaker_configs() {
            tracing::warn!("Breaker settings changed; they take effect after a restart");
        }
        if current.listener.bind_address != config.listener.bind_address {
            tracing::warn!("Listener address changed; it takes effect after a restart");
        }
        self.limiter.update_config(config.rate_limit.limiter.clone());
        self.config.store(Arc::new(config));
        tracing::info!("Configuration reloaded");
    }
}

/// HTTP server for the resilience service.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Same as [`HttpServer::new`] with an explicit time source.
    pub fn with_clock(config: ServiceConfig, clock: SharedClock) -> Self {
        let state = AppState::new(config, clock);
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The fully layered router, for serving or in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn build_router(state: AppState) -> Router {
        let config = state.config.load_full();

        let api = Router::new()
            .route("/api/ping", get(ping))
            .route("/api/dependencies", get(list_dependencies))
            .route("/api/dependencies/{name}", get(dependency_readiness))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                rate_limit_middleware,
            ));

        let mut router = Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_handler))
            .merge(api);

        if config.admin.enabled {
            router = router.merge(admin::setup_admin_router(state.clone()));
        }

        router
            .with_state(state)
            .layer(TimeoutLayer::new(config.timeouts.request()))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    /// Run the server, accepting connections on the given listener until
    /// `shutdown` fires and in-flight requests drain (or the grace period ends).
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ServiceConfig>,
        shutdown: CancellationToken,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");
        tracing::warn!(
            "Rate limiter and circuit breaker state is per process; replicas do not share it"
        );

        let tasks = shutdown.child_token();
        let observer = self.state.limiter.spawn_observer(tasks.clone());

        let reload_state = self.state.clone();
        let reload_token = tasks.clone();
        let reloader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reload_token.cancelled() => break,
                    update = config_updates.recv() => match update {
                        Some(config) => reload_state.apply_config(config),
                        None => break,
                    },
                }
            }
        });

        let grace = self.state.config.load().timeouts.shutdown_grace();
        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        let graceful = shutdown.clone();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .into_future();
        let mut serve = std::pin::pin!(serve);

        let result = tokio::select! {
            res = &mut serve => res,
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                tracing::warn!(grace = ?grace, "Grace period elapsed, dropping in-flight requests");
                Ok(())
            }
        };

        tasks.cancel();
        let _ = observer.await;
        let _ = reloader.await;

        tracing::info!("HTTP server stopped");
        result
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(prometheus) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            prometheus.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn ping() -> &'static str {
    "pong"
}

#[derive(Serialize)]
struct DependencySummary {
    name: String,
    state: CircuitState,
}

async fn list_dependencies(State(state): State<AppState>) -> Json<Vec<DependencySummary>> {
    let summaries = state
        .registry
        .snapshot()
        .into_iter()
        .map(|s| DependencySummary {
            name: s.name,
            state: s.state,
        })
        .collect();
    Json(summaries)
}

/// 200 while the dependency accepts calls, 503 with `Retry-After` while its breaker is open.
async fn dependency_readiness(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DependencySummary>, ApiError> {
    let breaker = state
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("unknown dependency '{name}'")))?;

    let status = breaker.status();
    if status.state == CircuitState::Open {
        return Err(Rejection {
            breaker: status.name,
            state: status.state,
            retry_after: status
                .retry_after_secs
                .map(Duration::from_secs_f64),
        }
        .into());
    }

    Ok(Json(DependencySummary {
        name: status.name,
        state: status.state,
    }))
}
