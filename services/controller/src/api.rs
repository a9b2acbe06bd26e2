//! HTTP API handlers and routing.
//!
//! Operator-facing endpoints under /v1/fleet. These are localhost-only
//! control endpoints, not tenant-facing.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use fleet_events::HealthEvent;

use crate::controller::Controller;
use crate::error::FleetError;
use crate::health::HealthMonitor;
use crate::model::ClusterState;
use crate::scaler::ScaleOutcome;
use crate::watchdog::Watchdog;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub monitor: Arc<HealthMonitor>,
    pub watchdog: Arc<Watchdog>,
}

/// Create the API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1/fleet", fleet_routes())
        .with_state(state)
}

fn fleet_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_fleet))
        .route("/events", get(get_events))
        .route("/scale", put(scale))
        .route("/health-check", post(run_health_check))
        .route("/balancer/reload", post(reload_balancer))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub desired_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only return events at or after this timestamp.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<HealthEvent>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    /// Whether a new configuration actually went live; false means the
    /// rendered config was identical to the one already applied.
    pub applied: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub completed: bool,
}

// =============================================================================
// Handlers
// =============================================================================

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn get_fleet(State(state): State<AppState>) -> Json<ClusterState> {
    Json(state.controller.get_cluster_state().await)
}

async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    let events = state.controller.get_health_events(query.since);
    Json(EventsResponse { events })
}

async fn scale(
    State(state): State<AppState>,
    Json(req): Json<ScaleRequest>,
) -> Result<Json<ScaleOutcome>, ApiError> {
    info!(desired_count = req.desired_count, "scale requested");
    let outcome = state.controller.set_desired_count(req.desired_count).await?;
    Ok(Json(outcome))
}

async fn run_health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    state.monitor.run_pass().await;
    state.watchdog.run_pass().await;
    Json(HealthCheckResponse { completed: true })
}

async fn reload_balancer(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let applied = state.controller.trigger_balancer_reload().await?;
    Ok(Json(ReloadResponse { applied }))
}

// =============================================================================
// Error mapping
// =============================================================================

/// Error body returned by all endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, detail: String) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                detail,
            },
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let detail = err.to_string();
        match err {
            FleetError::InvalidTarget { .. } | FleetError::InvalidConfig(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request", detail)
            }
            FleetError::ExhaustedRange { .. } | FleetError::PortInUse(_) => {
                Self::new(StatusCode::CONFLICT, "port_conflict", detail)
            }
            FleetError::RuntimeUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "runtime_unavailable", detail)
            }
            FleetError::Timeout { .. } => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout", detail)
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
