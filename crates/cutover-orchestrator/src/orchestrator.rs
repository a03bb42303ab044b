//! Orchestrator — accepts deployment requests and tracks them to completion.
//!
//! Each service has an async mutex. `deploy` takes its owned guard without
//! waiting and moves it into the deployment task, so a second request for
//! the same service is rejected until the first one has been recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, error, info, warn};

use cutover_core::{
    ActiveRelease, Deployment, DeploymentId, DeploymentState, GroupId, ServiceId, ServiceSpec,
    VersionSpec, deployment_id,
};
use cutover_rollout::{
    CancelHandle, DeploymentMachine, DeploymentOutcome, Services, cancel_pair,
};
use cutover_router::{RoutingState, plan_steps};
use cutover_state::HistoryStore;

use crate::error::{OrchestratorError, OrchestratorResult};

/// A deployment whose task has not finished bookkeeping yet.
struct ActiveDeployment {
    service_id: ServiceId,
    status: watch::Receiver<Deployment>,
    cancel: CancelHandle,
    /// Flips to true once the outcome is recorded and the service lock released.
    done: watch::Receiver<bool>,
}

struct Inner {
    services: Services,
    history: Arc<dyn HistoryStore>,
    registry: RwLock<HashMap<ServiceId, ServiceSpec>>,
    locks: Mutex<HashMap<ServiceId, Arc<tokio::sync::Mutex<()>>>>,
    active: RwLock<HashMap<DeploymentId, ActiveDeployment>>,
    /// Terminal deployments the history store refused to take.
    unrecorded: RwLock<HashMap<DeploymentId, Deployment>>,
    sequences: Mutex<HashMap<ServiceId, u64>>,
    stale: Mutex<Vec<GroupId>>,
    shutting_down: AtomicBool,
}

/// Deployment orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(services: Services, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                history,
                registry: RwLock::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                active: RwLock::new(HashMap::new()),
                unrecorded: RwLock::new(HashMap::new()),
                sequences: Mutex::new(HashMap::new()),
                stale: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Load previously registered services from the history store.
    ///
    /// Routing for services with an active release is recorded as 100% on
    /// that release's group.
    pub fn restore(&self) -> OrchestratorResult<usize> {
        let specs = self.inner.history.list_services()?;
        let count = specs.len();
        for spec in specs {
            self.inner.seed_sequence(&spec.id)?;
            self.inner
                .services
                .registry
                .track_service(&spec.id, &spec.image_repository);
            if let Some(active) = &spec.active {
                let group = GroupId::new(&spec.id, active.color);
                self.inner
                    .services
                    .router
                    .set_initial(&spec.id, RoutingState::all_to(&group));
            }
            debug!(service = %spec.id, active = ?spec.active.as_ref().map(|a| &a.version), "service restored");
            self.inner
                .registry
                .write()
                .expect("registry lock")
                .insert(spec.id.clone(), spec);
        }
        info!(count, "services restored");
        Ok(count)
    }

    /// Register a service, or update its settings.
    ///
    /// The active release of an already registered service is kept.
    pub fn register(&self, mut spec: ServiceSpec) -> OrchestratorResult<ServiceSpec> {
        if spec.desired_count == 0 {
            return Err(OrchestratorError::InvalidService {
                service: spec.id,
                reason: "desired_count must be at least 1".to_string(),
            });
        }
        if let Err(e) = plan_steps(&spec.plan) {
            return Err(OrchestratorError::InvalidService {
                service: spec.id,
                reason: e.to_string(),
            });
        }

        if let Some(existing) = self.get_service(&spec.id) {
            spec.active = existing.active;
        }
        self.inner.history.put_service(&spec)?;
        self.inner.seed_sequence(&spec.id)?;
        self.inner
            .services
            .registry
            .track_service(&spec.id, &spec.image_repository);
        self.inner
            .registry
            .write()
            .expect("registry lock")
            .insert(spec.id.clone(), spec.clone());

        info!(service = %spec.id, desired = spec.desired_count, "service registered");
        Ok(spec)
    }

    pub fn get_service(&self, service_id: &str) -> Option<ServiceSpec> {
        self.inner
            .registry
            .read()
            .expect("registry lock")
            .get(service_id)
            .cloned()
    }

    /// Registered services, sorted by id.
    pub fn list_services(&self) -> Vec<ServiceSpec> {
        let mut specs: Vec<_> = self
            .inner
            .registry
            .read()
            .expect("registry lock")
            .values()
            .cloned()
            .collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    /// Start deploying `version` to a service.
    ///
    /// Returns the new deployment in `Provisioning`. Fails with `Conflict`
    /// without touching anything if the service already has one running.
    pub async fn deploy(
        &self,
        service_id: &str,
        version: VersionSpec,
    ) -> OrchestratorResult<Deployment> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let spec = self
            .get_service(service_id)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(service_id.to_string()))?;

        let guard = self
            .inner
            .service_lock(service_id)
            .try_lock_owned()
            .map_err(|_| OrchestratorError::Conflict {
                service: service_id.to_string(),
                deployment: self
                    .inner
                    .active_for_service(service_id)
                    .unwrap_or_else(|| "finishing".to_string()),
            })?;

        let sequence = self.inner.next_sequence(service_id);
        let id = deployment_id(service_id, sequence);
        let source = spec.active.as_ref().map(|a| GroupId::new(service_id, a.color));
        let target = GroupId::new(service_id, spec.next_color());
        let deployment = Deployment::new(&id, service_id, &version.tag, source, target);

        let (cancel, token) = cancel_pair();
        let machine = DeploymentMachine::new(
            self.inner.services.clone(),
            spec,
            version,
            deployment.clone(),
            token,
        );
        let (done_tx, done_rx) = watch::channel(false);
        self.inner.active.write().expect("active lock").insert(
            id.clone(),
            ActiveDeployment {
                service_id: service_id.to_string(),
                status: machine.subscribe(),
                cancel,
                done: done_rx,
            },
        );

        info!(deployment = %id, service = service_id, version = %deployment.version, "deployment accepted");

        let inner = self.inner.clone();
        tokio::spawn(run_deployment(inner, machine, guard, done_tx));

        Ok(deployment)
    }

    /// Current snapshot of a deployment, running or finished.
    pub fn status(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        if let Some(active) = self
            .inner
            .active
            .read()
            .expect("active lock")
            .get(deployment_id)
        {
            return Ok(active.status.borrow().clone());
        }
        if let Some(deployment) = self.inner.history.get(deployment_id)? {
            return Ok(deployment);
        }
        self.inner
            .unrecorded
            .read()
            .expect("unrecorded lock")
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Ask a running deployment to roll back.
    ///
    /// Returns the snapshot at the time of the request; the rollback itself
    /// happens on the deployment's task. Once traffic is committed
    /// (`Finalizing`) the deployment can no longer be cancelled.
    pub fn cancel(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        {
            let active = self.inner.active.read().expect("active lock");
            if let Some(entry) = active.get(deployment_id) {
                let current = entry.status.borrow().clone();
                if current.is_terminal() {
                    return Err(OrchestratorError::AlreadyFinished(deployment_id.to_string()));
                }
                if current.state == DeploymentState::Finalizing {
                    return Err(OrchestratorError::Finalizing(deployment_id.to_string()));
                }
                if entry.cancel.cancel() {
                    info!(deployment = deployment_id, state = %current.state, "cancellation requested");
                }
                return Ok(current);
            }
        }
        // Not running: either finished or unknown.
        self.status(deployment_id)?;
        Err(OrchestratorError::AlreadyFinished(deployment_id.to_string()))
    }

    /// Finished deployments of a service, oldest first.
    pub fn history(&self, service_id: &str) -> OrchestratorResult<Vec<Deployment>> {
        if self.get_service(service_id).is_none() {
            return Err(OrchestratorError::ServiceNotFound(service_id.to_string()));
        }
        Ok(self.inner.history.list_for_service(service_id)?)
    }

    /// The running deployment of a service, if any.
    pub fn active_deployment(&self, service_id: &str) -> Option<Deployment> {
        self.inner
            .active
            .read()
            .expect("active lock")
            .values()
            .find(|a| a.service_id == service_id)
            .map(|a| a.status.borrow().clone())
    }

    /// Traffic split currently applied for a service.
    pub fn routing(&self, service_id: &str) -> Option<RoutingState> {
        self.inner.services.router.routing_state(service_id)
    }

    /// Wait until a deployment is finished and recorded.
    pub async fn wait(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        let done = self
            .inner
            .active
            .read()
            .expect("active lock")
            .get(deployment_id)
            .map(|a| a.done.clone());
        if let Some(mut done) = done {
            // A dropped sender also means the task is gone.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.status(deployment_id)
    }

    /// Groups whose teardown failed and are waiting for a retry.
    pub fn stale_groups(&self) -> Vec<GroupId> {
        self.inner.stale.lock().expect("stale lock").clone()
    }

    /// Retry terminating stale groups. Returns how many were retired.
    ///
    /// Services with a deployment in progress are skipped, and so are
    /// groups that may still receive traffic.
    pub async fn retry_stale_groups(&self) -> usize {
        let pending = std::mem::take(&mut *self.inner.stale.lock().expect("stale lock"));
        let mut retired = 0;
        let mut remaining = Vec::new();

        for group in pending {
            let Ok(_guard) = self.inner.service_lock(&group.service_id).try_lock_owned() else {
                remaining.push(group);
                continue;
            };
            if !self.inner.services.targets.contains(&group) {
                continue;
            }
            if self.inner.is_routed(&group) {
                remaining.push(group);
                continue;
            }
            match self.inner.services.targets.terminate(&group).await {
                Ok(()) => {
                    info!(group = %group, "stale group retired");
                    retired += 1;
                }
                Err(e) => {
                    warn!(group = %group, error = %e, "stale group teardown failed again");
                    remaining.push(group);
                }
            }
        }

        self.inner
            .stale
            .lock()
            .expect("stale lock")
            .extend(remaining);
        retired
    }

    /// Cancel every running deployment and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let running: Vec<(DeploymentId, watch::Receiver<bool>)> = {
            let active = self.inner.active.read().expect("active lock");
            for entry in active.values() {
                entry.cancel.cancel();
            }
            active
                .iter()
                .map(|(id, a)| (id.clone(), a.done.clone()))
                .collect()
        };

        info!(count = running.len(), "orchestrator shutting down");
        for (id, mut done) in running {
            let _ = done.wait_for(|finished| *finished).await;
            debug!(deployment = %id, "deployment drained");
        }
    }
}

impl Inner {
    fn service_lock(&self, service_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("locks lock")
            .entry(service_id.to_string())
            .or_default()
            .clone()
    }

    fn active_for_service(&self, service_id: &str) -> Option<DeploymentId> {
        self.active
            .read()
            .expect("active lock")
            .iter()
            .find(|(_, a)| a.service_id == service_id)
            .map(|(id, _)| id.clone())
    }

    /// Make sure sequence numbers continue after recorded history.
    fn seed_sequence(&self, service_id: &str) -> OrchestratorResult<()> {
        let last = self
            .history
            .list_for_service(service_id)?
            .last()
            .map(Deployment::sequence)
            .unwrap_or(0);
        let mut sequences = self.sequences.lock().expect("sequences lock");
        let entry = sequences.entry(service_id.to_string()).or_insert(0);
        *entry = (*entry).max(last);
        Ok(())
    }

    fn next_sequence(&self, service_id: &str) -> u64 {
        let mut sequences = self.sequences.lock().expect("sequences lock");
        let entry = sequences.entry(service_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Whether the router may still send traffic to `group`.
    fn is_routed(&self, group: &GroupId) -> bool {
        self.services.router.carries_traffic(&group.service_id, group)
    }

    /// A leftover group in the target color blocks provisioning. Tear it
    /// down first unless it may still be routed to.
    async fn clear_target(&self, target: &GroupId) {
        if !self.services.targets.contains(target) {
            return;
        }
        if self.is_routed(target) {
            warn!(group = %target, "leftover group may still carry traffic, leaving it in place");
            return;
        }
        match self.services.targets.terminate(target).await {
            Ok(()) => {
                self.stale.lock().expect("stale lock").retain(|g| g != target);
                info!(group = %target, "leftover group retired before provisioning");
            }
            Err(e) => warn!(group = %target, error = %e, "leftover group teardown failed"),
        }
    }

    fn record(&self, outcome: DeploymentOutcome) {
        let deployment = outcome.deployment;

        if let Some(group) = outcome.stale_group {
            self.stale.lock().expect("stale lock").push(group);
        }
        if deployment.state == DeploymentState::Failed
            && self.services.targets.contains(&deployment.target_group)
        {
            if self.is_routed(&deployment.target_group) {
                error!(
                    deployment = %deployment.id,
                    group = %deployment.target_group,
                    "failed deployment left a group that may carry traffic; operator action required"
                );
            } else {
                self.stale
                    .lock()
                    .expect("stale lock")
                    .push(deployment.target_group.clone());
            }
        }

        if deployment.state == DeploymentState::Succeeded {
            let updated = {
                let mut registry = self.registry.write().expect("registry lock");
                registry.get_mut(&deployment.service_id).map(|spec| {
                    spec.active = Some(ActiveRelease {
                        color: deployment.target_group.color,
                        version: deployment.version.clone(),
                        deployment_id: deployment.id.clone(),
                    });
                    spec.clone()
                })
            };
            if let Some(spec) = updated {
                if let Err(e) = self.history.put_service(&spec) {
                    error!(service = %spec.id, error = %e, "failed to persist active release");
                }
            }
        }

        if let Err(e) = self.history.append(&deployment) {
            error!(deployment = %deployment.id, error = %e, "failed to record deployment history");
            self.unrecorded
                .write()
                .expect("unrecorded lock")
                .insert(deployment.id.clone(), deployment.clone());
        }
        self.active.write().expect("active lock").remove(&deployment.id);

        match deployment.state {
            DeploymentState::Succeeded => {
                info!(deployment = %deployment.id, "deployment succeeded")
            }
            state => warn!(
                deployment = %deployment.id,
                %state,
                reason = ?deployment.failure_reason.as_ref().map(ToString::to_string),
                "deployment did not succeed"
            ),
        }
    }
}

async fn run_deployment(
    inner: Arc<Inner>,
    machine: DeploymentMachine,
    guard: OwnedMutexGuard<()>,
    done: watch::Sender<bool>,
) {
    let target = machine.target_group().clone();
    inner.clear_target(&target).await;
    let outcome = machine.run().await;
    inner.record(outcome);
    drop(guard);
    let _ = done.send(true);
}
