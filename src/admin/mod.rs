//! Authenticated status surface for operators.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/{name}", get(get_breaker))
        .route("/admin/limiter", get(get_limiter))
        .route("/admin/config", get(get_config))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}
