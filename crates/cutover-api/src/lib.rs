//! cutover-api — REST API for Cutover.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/services` | List registered services |
//! | POST | `/api/v1/services` | Register or update a service |
//! | GET | `/api/v1/services/{id}` | Service, routing, running deployment |
//! | POST | `/api/v1/services/{id}/deployments` | Start a deployment |
//! | GET | `/api/v1/services/{id}/deployments` | Deployment history |
//! | GET | `/api/v1/deployments/{id}` | Deployment status |
//! | POST | `/api/v1/deployments/{id}/cancel` | Cancel a running deployment |
//! | POST | `/api/v1/maintenance/stale-groups` | Retry stale group teardown |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use cutover_orchestrator::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route(
            "/services",
            get(handlers::list_services).post(handlers::register_service),
        )
        .route("/services/{id}", get(handlers::get_service))
        .route(
            "/services/{id}/deployments",
            get(handlers::list_history).post(handlers::start_deployment),
        )
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/cancel", post(handlers::cancel_deployment))
        .route("/maintenance/stale-groups", post(handlers::retry_stale_groups))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
