//! HTTP surface tests: drive the router with `oneshot` against simulated
//! backends and check status codes and envelopes.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use cutover_api::build_router;
use cutover_core::{DeploymentState, ProbeConfig, ServiceSpec};
use cutover_health::{HealthProber, ProbeResult, ScriptedProbe};
use cutover_orchestrator::Orchestrator;
use cutover_platform::{SimCompute, SimLoadBalancer, SimRegistry};
use cutover_rollout::Services;
use cutover_router::TrafficRouter;
use cutover_state::StateStore;
use cutover_targets::TargetGroupModel;

struct Harness {
    router: Router,
    orch: Orchestrator,
    probe: Arc<ScriptedProbe>,
}

fn harness() -> Harness {
    let registry = Arc::new(SimRegistry::new());
    registry.register_repository("orders", "registry.local/orders");
    let compute = Arc::new(SimCompute::new());
    let targets = Arc::new(TargetGroupModel::new(compute, 8));
    let probe = Arc::new(ScriptedProbe::always(ProbeResult::Healthy));
    let services = Services {
        registry,
        prober: HealthProber::new(targets.clone(), probe.clone()),
        targets,
        router: Arc::new(TrafficRouter::new(Arc::new(SimLoadBalancer::new()))),
    };
    let store = StateStore::open_in_memory().unwrap();
    let orch = Orchestrator::new(services, Arc::new(store));

    let mut spec = ServiceSpec::new("orders", "registry.local/orders", 2);
    spec.health = ProbeConfig {
        interval: Duration::from_secs(1),
        retries: 3,
        ..Default::default()
    };
    spec.validation_timeout = Duration::from_secs(30);
    orch.register(spec).unwrap();

    Harness {
        router: build_router(orch.clone()),
        orch,
        probe,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };
    let resp = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn healthz_reports_ok() {
    let h = harness();
    let (status, body) = send(&h.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], "ok");
}

#[tokio::test]
async fn list_services_returns_registered() {
    let h = harness();
    let (status, body) = send(&h.router, "GET", "/api/v1/services", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"][0]["id"], "orders");
}

#[tokio::test]
async fn register_service_from_config_shape() {
    let h = harness();
    let (status, body) = send(
        &h.router,
        "POST",
        "/api/v1/services",
        Some(json!({
            "id": "payments",
            "image": "registry.local/payments",
            "desired_count": 3,
            "plan": { "strategy": "weighted", "steps": [{ "weight": 25, "hold": "10s" }] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["desired_count"], 3);
    assert!(h.orch.get_service("payments").is_some());
}

#[tokio::test]
async fn register_rejects_bad_service() {
    let h = harness();
    let (status, body) = send(
        &h.router,
        "POST",
        "/api/v1/services",
        Some(json!({ "id": "payments", "image": "registry.local/payments", "desired_count": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("desired_count"));
}

#[tokio::test]
async fn deploy_unknown_service_is_not_found() {
    let h = harness();
    let (status, body) = send(
        &h.router,
        "POST",
        "/api/v1/services/nope/deployments",
        Some(json!({ "tag": "v1" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn deploy_rejects_empty_tag() {
    let h = harness();
    let (status, _) = send(
        &h.router,
        "POST",
        "/api/v1/services/orders/deployments",
        Some(json!({ "tag": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn deploy_then_status_then_history() {
    let h = harness();
    let (status, body) = send(
        &h.router,
        "POST",
        "/api/v1/services/orders/deployments",
        Some(json!({ "tag": "v1", "env": { "LOG_LEVEL": "debug" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["state"], "provisioning");
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(id, "orders-1");

    let done = h.orch.wait(&id).await.unwrap();
    assert_eq!(done.state, DeploymentState::Succeeded);

    let (status, body) = send(&h.router, "GET", &format!("/api/v1/deployments/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "succeeded");
    assert_eq!(body["data"]["version"], "v1");

    let (status, body) = send(&h.router, "GET", "/api/v1/services/orders/deployments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(&h.router, "GET", "/api/v1/services/orders", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["routing"]["blue"], 100);
    assert!(body["data"]["active_deployment"].is_null());
}

#[tokio::test(start_paused = true)]
async fn second_deploy_conflicts_while_first_runs() {
    let h = harness();
    h.probe.set_default(ProbeResult::Unhealthy);

    let (status, first) = send(
        &h.router,
        "POST",
        "/api/v1/services/orders/deployments",
        Some(json!({ "tag": "v1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &h.router,
        "POST",
        "/api/v1/services/orders/deployments",
        Some(json!({ "tag": "v2" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("orders-1"));

    let (status, body) = send(&h.router, "GET", "/api/v1/services/orders", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["active_deployment"]["id"], first["data"]["id"]);
}

#[tokio::test(start_paused = true)]
async fn cancel_is_accepted_then_conflicts_once_finished() {
    let h = harness();
    h.probe.set_default(ProbeResult::Unhealthy);

    let (_, body) = send(
        &h.router,
        "POST",
        "/api/v1/services/orders/deployments",
        Some(json!({ "tag": "v1" })),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&h.router, "POST", &format!("/api/v1/deployments/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let done = h.orch.wait(&id).await.unwrap();
    assert_eq!(done.state, DeploymentState::RolledBack);

    let (status, body) = send(&h.router, "POST", &format!("/api/v1/deployments/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn unknown_deployment_is_not_found() {
    let h = harness();
    let (status, _) = send(&h.router, "GET", "/api/v1/deployments/orders-42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&h.router, "POST", "/api/v1/deployments/orders-42/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&h.router, "GET", "/api/v1/services/nope/deployments", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deploy_during_shutdown_is_unavailable() {
    let h = harness();
    h.orch.shutdown().await;
    let (status, _) = send(
        &h.router,
        "POST",
        "/api/v1/services/orders/deployments",
        Some(json!({ "tag": "v1" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn stale_group_retry_reports_nothing_pending() {
    let h = harness();
    let (status, body) = send(&h.router, "POST", "/api/v1/maintenance/stale-groups", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["retired"], 0);
    assert_eq!(body["data"]["remaining"].as_array().unwrap().len(), 0);
}
