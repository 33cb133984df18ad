use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::http::server::AppState;
use crate::resilience::circuit_breaker::{BreakerStatus, CircuitState};
use crate::security::rate_limit::LimiterStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub open_breakers: Vec<String>,
    pub limiter: LimiterStatus,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let open_breakers: Vec<String> = state
        .registry
        .snapshot()
        .into_iter()
        .filter(|b| b.state != CircuitState::Closed)
        .map(|b| b.name)
        .collect();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if open_breakers.is_empty() {
            "operational"
        } else {
            "degraded"
        },
        uptime_secs: state.started_at.elapsed().as_secs(),
        open_breakers,
        limiter: state.limiter.status(),
    })
}

pub async fn get_breakers(State(state): State<AppState>) -> Json<Vec<BreakerStatus>> {
    Json(state.registry.snapshot())
}

pub async fn get_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<BreakerStatus>, StatusCode> {
    state
        .registry
        .get(&name)
        .map(|b| Json(b.status()))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn get_limiter(State(state): State<AppState>) -> Json<LimiterStatus> {
    Json(state.limiter.status())
}

/// Running config with the admin key redacted.
pub async fn get_config(State(state): State<AppState>) -> Json<ServiceConfig> {
    let mut config = ServiceConfig::clone(&state.config.load());
    config.admin.api_key = "<redacted>".to_string();
    Json(config)
}
