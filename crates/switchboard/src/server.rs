//! HTTP server assembly: health endpoints plus the webhook surface.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde_json::json;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::gate::Gate;
use crate::heartbeat::HeartbeatScheduler;
use crate::hooks::{self, HookRegistry};
use crate::run::RunCoordinator;
use crate::session::SessionManager;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub coordinator: RunCoordinator,
    pub heartbeat: Arc<HeartbeatScheduler>,
    pub gate: Arc<Gate>,
    pub hooks: Arc<HookRegistry>,
    /// Gateway token guarding /hooks and /status.
    pub token: Option<String>,
    pub start_time: std::time::Instant,
}

pub fn build_app(
    state: AppState,
    request_timeout_seconds: u64,
    body_limit_bytes: usize,
    max_connections: usize,
) -> Router {
    // Token-gated routes: webhook ingestor and the status surface.
    let hook_routes = Router::new()
        .route("/hooks/wake", post(hooks::post_wake))
        .route("/hooks/agent", post(hooks::post_agent))
        .route("/hooks/{name}", post(hooks::post_named))
        .route("/status", get(hooks::get_status))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            hooks::require_token,
        ))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_seconds),
        ))
        .layer(ConcurrencyLimitLayer::new(max_connections))
        .with_state(state.clone());

    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .with_state(state)
        .merge(hook_routes)
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "ready": true,
            "uptimeSeconds": state.start_time.elapsed().as_secs(),
        })),
    )
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
