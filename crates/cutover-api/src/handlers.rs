//! REST API handlers.
//!
//! Each handler calls into the `Orchestrator` and returns JSON responses
//! wrapped in a `{success, data, error}` envelope.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::{debug, warn};

use cutover_core::config::ServiceConfig;
use cutover_core::{Deployment, GroupColor, GroupId, ServiceSpec, VersionSpec};
use cutover_orchestrator::OrchestratorError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Map an orchestrator error onto its HTTP status.
fn orchestrator_error(e: &OrchestratorError) -> axum::response::Response {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_conflict() {
        StatusCode::CONFLICT
    } else {
        match e {
            OrchestratorError::InvalidService { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => {
                warn!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    };
    error_response(&e.to_string(), status).into_response()
}

/// Service detail: settings, current traffic split, running deployment.
#[derive(Serialize)]
pub struct ServiceView {
    pub service: ServiceSpec,
    /// Percentage of traffic per color. Empty before the first release.
    pub routing: BTreeMap<GroupColor, u8>,
    pub active_deployment: Option<Deployment>,
}

#[derive(Serialize)]
pub struct StaleGroupsReport {
    pub retired: usize,
    pub remaining: Vec<GroupId>,
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

// ── Services ───────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.list_services())
}

/// POST /api/v1/services
///
/// Takes the same shape as a `[[services]]` entry in `cutover.toml`.
pub async fn register_service(
    State(state): State<ApiState>,
    Json(config): Json<ServiceConfig>,
) -> impl IntoResponse {
    let spec = match config.to_spec() {
        Ok(spec) => spec,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    };
    match state.orchestrator.register(spec) {
        Ok(spec) => (StatusCode::CREATED, ApiResponse::ok(spec)).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// GET /api/v1/services/:id
pub async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(service) = state.orchestrator.get_service(&id) else {
        return error_response("service not found", StatusCode::NOT_FOUND).into_response();
    };
    let routing = state
        .orchestrator
        .routing(&id)
        .map(|r| r.by_color())
        .unwrap_or_default();
    let view = ServiceView {
        service,
        routing,
        active_deployment: state.orchestrator.active_deployment(&id),
    };
    ApiResponse::ok(view).into_response()
}

// ── Deployments ────────────────────────────────────────────────

/// POST /api/v1/services/:id/deployments
pub async fn start_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(version): Json<VersionSpec>,
) -> impl IntoResponse {
    if version.tag.trim().is_empty() {
        return error_response("version tag must not be empty", StatusCode::BAD_REQUEST)
            .into_response();
    }
    match state.orchestrator.deploy(&id, version).await {
        Ok(deployment) => {
            debug!(deployment = %deployment.id, "deployment started via api");
            (StatusCode::CREATED, ApiResponse::ok(deployment)).into_response()
        }
        Err(e) => orchestrator_error(&e),
    }
}

/// GET /api/v1/services/:id/deployments
pub async fn list_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.history(&id) {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// GET /api/v1/deployments/:id
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.status(&id) {
        Ok(deployment) => ApiResponse::ok(deployment).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// POST /api/v1/deployments/:id/cancel
///
/// Accepted, not completed: the rollback runs on the deployment's task.
pub async fn cancel_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.cancel(&id) {
        Ok(deployment) => (StatusCode::ACCEPTED, ApiResponse::ok(deployment)).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

// ── Maintenance ────────────────────────────────────────────────

/// POST /api/v1/maintenance/stale-groups
pub async fn retry_stale_groups(State(state): State<ApiState>) -> impl IntoResponse {
    let retired = state.orchestrator.retry_stale_groups().await;
    ApiResponse::ok(StaleGroupsReport {
        retired,
        remaining: state.orchestrator.stale_groups(),
    })
}
