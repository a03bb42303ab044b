//! The deployment history contract the orchestrator writes through.

use cutover_core::{Deployment, ServiceSpec};

use crate::error::StateResult;

/// Append-only persistence of terminal deployments plus the service registry.
///
/// Not a cache: nothing is ever evicted.
pub trait HistoryStore: Send + Sync {
    /// Persist a terminal deployment. Fails if the id was already recorded
    /// or the deployment has not reached a terminal state.
    fn append(&self, deployment: &Deployment) -> StateResult<()>;

    /// Look up a recorded deployment.
    fn get(&self, deployment_id: &str) -> StateResult<Option<Deployment>>;

    /// All recorded deployments of a service, oldest first.
    fn list_for_service(&self, service_id: &str) -> StateResult<Vec<Deployment>>;

    /// Insert or update a registered service.
    fn put_service(&self, spec: &ServiceSpec) -> StateResult<()>;

    /// All registered services.
    fn list_services(&self) -> StateResult<Vec<ServiceSpec>>;
}
