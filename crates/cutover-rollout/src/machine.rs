//! Deployment state machine — drives one deployment from `Provisioning`
//! to a terminal state.
//!
//! Cancellation is observed while resolving the image, right after the
//! target group is created, while waiting for quorum, and during every
//! traffic step. Teardown in `Finalizing` and `RollingBack` always runs
//! to completion.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use cutover_core::{
    Deployment, DeploymentState, FailureReason, GroupId, InstanceSpec, ServiceSpec, VersionSpec,
};
use cutover_health::{HealthProber, HealthSubscription, QuorumGate};
use cutover_platform::ContainerRegistry;
use cutover_router::{RouterError, TrafficRouter};
use cutover_targets::{TargetError, TargetGroupModel};

use crate::cancel::CancelToken;

/// Collaborators a deployment drives. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<dyn ContainerRegistry>,
    pub targets: Arc<TargetGroupModel>,
    pub prober: HealthProber,
    pub router: Arc<TrafficRouter>,
}

/// What a finished deployment hands back to its owner.
#[derive(Debug, Clone)]
pub struct DeploymentOutcome {
    /// Terminal snapshot.
    pub deployment: Deployment,
    /// Source group whose teardown failed while finalizing.
    pub stale_group: Option<GroupId>,
}

/// Why the happy path was left.
enum Abort {
    /// Nothing to undo: go straight to `Failed`.
    Fail(FailureReason),
    /// Undo routing and the new group.
    RollBack(FailureReason),
}

pub struct DeploymentMachine {
    services: Services,
    service: ServiceSpec,
    version: VersionSpec,
    deployment: Deployment,
    status: watch::Sender<Deployment>,
    cancel: CancelToken,
    group_created: bool,
}

impl DeploymentMachine {
    /// `deployment` must be freshly created, in `Provisioning`.
    pub fn new(
        services: Services,
        service: ServiceSpec,
        version: VersionSpec,
        deployment: Deployment,
        cancel: CancelToken,
    ) -> Self {
        let (status, _) = watch::channel(deployment.clone());
        Self {
            services,
            service,
            version,
            deployment,
            status,
            cancel,
            group_created: false,
        }
    }

    /// Stream of deployment snapshots, one per transition.
    pub fn subscribe(&self) -> watch::Receiver<Deployment> {
        self.status.subscribe()
    }

    pub fn target_group(&self) -> &GroupId {
        &self.deployment.target_group
    }

    /// Drive the deployment to a terminal state.
    pub async fn run(mut self) -> DeploymentOutcome {
        info!(
            deployment = %self.deployment.id,
            service = %self.service.id,
            version = %self.version.tag,
            target = %self.deployment.target_group,
            "deployment started"
        );

        let stale_group = match self.advance().await {
            Ok(stale) => stale,
            Err(Abort::Fail(reason)) => {
                error!(deployment = %self.deployment.id, %reason, "deployment failed");
                self.enter(DeploymentState::Failed, Some(reason));
                None
            }
            Err(Abort::RollBack(reason)) => {
                self.roll_back(reason).await;
                None
            }
        };

        info!(
            deployment = %self.deployment.id,
            state = %self.deployment.state,
            "deployment finished"
        );
        DeploymentOutcome {
            deployment: self.deployment,
            stale_group,
        }
    }

    async fn advance(&mut self) -> Result<Option<GroupId>, Abort> {
        self.provision().await?;
        self.enter(DeploymentState::Validating, None);
        self.validate().await?;
        self.enter(DeploymentState::Shifting, None);
        self.shift().await?;
        self.enter(DeploymentState::Finalizing, None);
        Ok(self.finalize().await)
    }

    async fn provision(&mut self) -> Result<(), Abort> {
        if self.cancel.is_cancelled() {
            return Err(Abort::RollBack(FailureReason::Cancelled));
        }

        let image = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Abort::RollBack(FailureReason::Cancelled)),
            resolved = self.services.registry.resolve_image(&self.service.id, &self.version.tag) => {
                resolved.map_err(|e| Abort::Fail(FailureReason::Registry { message: e.to_string() }))?
            }
        };
        debug!(deployment = %self.deployment.id, %image, "image resolved");

        let spec = InstanceSpec {
            service_id: self.service.id.clone(),
            image,
            port: self.service.port,
            env: self.version.env.clone(),
            config_artifact: self.version.config_artifact.clone(),
        };

        // Creation runs to completion even when cancelled.
        self.services
            .targets
            .create(
                self.deployment.target_group.clone(),
                &self.version.tag,
                &spec,
                self.service.desired_count,
            )
            .await
            .map_err(|e| match e {
                TargetError::Capacity { requested, ceiling } => {
                    Abort::Fail(FailureReason::Capacity { requested, ceiling })
                }
                other => Abort::Fail(FailureReason::Launch {
                    message: other.to_string(),
                }),
            })?;
        self.group_created = true;

        if self.cancel.is_cancelled() {
            return Err(Abort::RollBack(FailureReason::Cancelled));
        }
        Ok(())
    }

    async fn validate(&mut self) -> Result<(), Abort> {
        let config = self.service.health.clone();
        let mut subscription = self
            .services
            .prober
            .watch(&self.deployment.target_group, &config)
            .map_err(|e| {
                Abort::RollBack(FailureReason::Launch {
                    message: e.to_string(),
                })
            })?;
        let mut gate = QuorumGate::new(&config);
        let timeout = self.service.validation_timeout;

        let waited = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Abort::RollBack(FailureReason::Cancelled)),
            waited = tokio::time::timeout(timeout, wait_for_quorum(&mut subscription, &mut gate)) => waited,
        };

        if let Ok(true) = waited {
            info!(
                deployment = %self.deployment.id,
                snapshots = gate.required(),
                "target group reached healthy quorum"
            );
            return Ok(());
        }

        let (healthy, total) = subscription
            .latest()
            .map(|s| (s.healthy as u32, s.total as u32))
            .unwrap_or((0, self.service.desired_count));
        warn!(
            deployment = %self.deployment.id,
            healthy,
            total,
            timeout = ?timeout,
            "validation timed out"
        );
        Err(Abort::RollBack(FailureReason::HealthCheckTimeout {
            healthy,
            total,
        }))
    }

    async fn shift(&mut self) -> Result<(), Abort> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Abort::RollBack(FailureReason::Cancelled)),
            result = self.services.router.shift_traffic(
                &self.service.id,
                self.deployment.source_group.as_ref(),
                &self.deployment.target_group,
                &self.service.plan,
                self.service.shift_step_timeout,
            ) => result,
        };

        match result {
            Ok(state) => {
                debug!(deployment = %self.deployment.id, weights = ?state.by_color(), "traffic shifted");
                Ok(())
            }
            Err(RouterError::RoutingFailure { step, reason }) => {
                Err(Abort::RollBack(FailureReason::RoutingFailure {
                    step,
                    message: reason,
                }))
            }
            Err(other) => Err(Abort::RollBack(FailureReason::RoutingFailure {
                step: 0,
                message: other.to_string(),
            })),
        }
    }

    /// Retire the source group. Teardown failure does not fail the
    /// deployment; the group is reported as stale instead.
    async fn finalize(&mut self) -> Option<GroupId> {
        self.services.router.commit(&self.service.id);

        let mut stale = None;
        if let Some(source) = self.deployment.source_group.clone() {
            if self.services.targets.contains(&source) {
                match self.services.targets.terminate(&source).await {
                    Ok(()) => debug!(deployment = %self.deployment.id, group = %source, "source group retired"),
                    Err(e) => {
                        warn!(
                            deployment = %self.deployment.id,
                            group = %source,
                            error = %e,
                            "source group teardown failed, leaving for retry"
                        );
                        stale = Some(source);
                    }
                }
            }
        }

        self.enter(DeploymentState::Succeeded, None);
        stale
    }

    async fn roll_back(&mut self, reason: FailureReason) {
        warn!(deployment = %self.deployment.id, %reason, "rolling back");
        self.enter(DeploymentState::RollingBack, Some(reason));

        if let Err(e) = self.services.router.revert(&self.service.id).await {
            error!(deployment = %self.deployment.id, error = %e, "traffic revert failed");
            self.enter(
                DeploymentState::Failed,
                Some(FailureReason::RoutingFailure {
                    step: 0,
                    message: e.to_string(),
                }),
            );
            return;
        }

        if self.group_created {
            let target = self.deployment.target_group.clone();
            if let Err(e) = self.services.targets.terminate(&target).await {
                error!(deployment = %self.deployment.id, group = %target, error = %e, "target group teardown failed");
                self.enter(
                    DeploymentState::Failed,
                    Some(FailureReason::Termination {
                        message: e.to_string(),
                    }),
                );
                return;
            }
        }

        self.enter(DeploymentState::RolledBack, None);
    }

    fn enter(&mut self, next: DeploymentState, reason: Option<FailureReason>) {
        let from = self.deployment.state;
        if let Err(e) = self.deployment.transition(next, reason) {
            error!(deployment = %self.deployment.id, error = %e, "rejected transition");
            return;
        }
        info!(
            deployment = %self.deployment.id,
            service = %self.deployment.service_id,
            %from,
            to = %next,
            "deployment state changed"
        );
        self.status.send_replace(self.deployment.clone());
    }
}

async fn wait_for_quorum(subscription: &mut HealthSubscription, gate: &mut QuorumGate) -> bool {
    while let Some(snapshot) = subscription.next().await {
        if gate.observe(&snapshot) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cutover_core::{ActiveRelease, GroupColor, ProbeConfig, ShiftPlan, ShiftStep};
    use cutover_health::{ProbeResult, ScriptedProbe};
    use cutover_platform::{SimCompute, SimLoadBalancer, SimRegistry};

    use crate::cancel::cancel_pair;

    struct Harness {
        compute: Arc<SimCompute>,
        lb: Arc<SimLoadBalancer>,
        probe: Arc<ScriptedProbe>,
        services: Services,
    }

    fn harness(ceiling: u32) -> Harness {
        let registry = Arc::new(SimRegistry::new());
        registry.register_repository("orders", "registry.local/orders");
        let compute = Arc::new(SimCompute::new());
        let lb = Arc::new(SimLoadBalancer::new());
        let probe = Arc::new(ScriptedProbe::always(ProbeResult::Healthy));
        let targets = Arc::new(TargetGroupModel::new(compute.clone(), ceiling));
        let services = Services {
            registry,
            prober: HealthProber::new(targets.clone(), probe.clone()),
            targets,
            router: Arc::new(TrafficRouter::new(lb.clone())),
        };
        Harness {
            compute,
            lb,
            probe,
            services,
        }
    }

    fn orders(desired_count: u32) -> ServiceSpec {
        let mut spec = ServiceSpec::new("orders", "registry.local/orders", desired_count);
        spec.health = ProbeConfig {
            interval: Duration::from_secs(1),
            retries: 3,
            sustain: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        spec.validation_timeout = Duration::from_secs(30);
        spec.shift_step_timeout = Duration::from_secs(5);
        spec
    }

    fn blue() -> GroupId {
        GroupId::new("orders", GroupColor::Blue)
    }

    fn green() -> GroupId {
        GroupId::new("orders", GroupColor::Green)
    }

    fn machine(h: &Harness, service: &ServiceSpec, seq: u64, tag: &str) -> (DeploymentMachine, crate::CancelHandle) {
        let source = service
            .active
            .as_ref()
            .map(|a| GroupId::new(&service.id, a.color));
        let target = GroupId::new(&service.id, service.next_color());
        let deployment = Deployment::new(&format!("orders-{seq}"), &service.id, tag, source, target);
        let (handle, token) = cancel_pair();
        let machine = DeploymentMachine::new(
            h.services.clone(),
            service.clone(),
            VersionSpec::new(tag),
            deployment,
            token,
        );
        (machine, handle)
    }

    /// Deploy v1 into blue and return the service with blue active.
    async fn serving_v1(h: &Harness) -> ServiceSpec {
        let mut service = orders(2);
        let (m, _) = machine(h, &service, 1, "v1");
        let outcome = m.run().await;
        assert_eq!(outcome.deployment.state, DeploymentState::Succeeded);
        service.active = Some(ActiveRelease {
            color: GroupColor::Blue,
            version: "v1".to_string(),
            deployment_id: "orders-1".to_string(),
        });
        service
    }

    fn states(d: &Deployment) -> Vec<DeploymentState> {
        d.transitions.iter().map(|t| t.state).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn first_deployment_routes_all_traffic_to_new_group() {
        let h = harness(8);
        let (m, _) = machine(&h, &orders(2), 1, "v1");
        let outcome = m.run().await;

        use DeploymentState::*;
        assert_eq!(
            states(&outcome.deployment),
            vec![Provisioning, Validating, Shifting, Finalizing, Succeeded]
        );
        assert!(outcome.deployment.source_group.is_none());
        assert!(outcome.deployment.ended_at_ms.is_some());
        assert_eq!(h.lb.weights("orders").unwrap()[&blue()], 100);
        assert_eq!(h.compute.running_version("orders", "v1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blue_green_cutover_retires_source() {
        let h = harness(8);
        let service = serving_v1(&h).await;

        let (m, _) = machine(&h, &service, 2, "v2");
        let outcome = m.run().await;

        assert_eq!(outcome.deployment.state, DeploymentState::Succeeded);
        assert!(outcome.stale_group.is_none());
        let weights = h.lb.weights("orders").unwrap();
        assert_eq!(weights[&green()], 100);
        assert_eq!(weights[&blue()], 0);
        assert!(h.compute.running_version("orders", "v1").is_empty());
        assert_eq!(h.compute.running_version("orders", "v2").len(), 2);
        assert!(!h.services.targets.contains(&blue()));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_group_times_out_and_rolls_back() {
        let h = harness(8);
        let service = serving_v1(&h).await;
        let calls = h.lb.call_count();
        h.probe.set_default(ProbeResult::Failed);

        let (m, _) = machine(&h, &service, 2, "v2");
        let outcome = m.run().await;

        assert_eq!(outcome.deployment.state, DeploymentState::RolledBack);
        assert_eq!(
            outcome.deployment.failure_reason,
            Some(FailureReason::HealthCheckTimeout {
                healthy: 0,
                total: 2
            })
        );
        assert_eq!(h.lb.call_count(), calls);
        assert_eq!(h.lb.weights("orders").unwrap()[&blue()], 100);
        assert!(h.compute.running_version("orders", "v2").is_empty());
        assert_eq!(h.compute.running_version("orders", "v1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_error_fails_without_launching() {
        let h = harness(4);
        let (m, _) = machine(&h, &orders(5), 1, "v1");
        let outcome = m.run().await;

        use DeploymentState::*;
        assert_eq!(states(&outcome.deployment), vec![Provisioning, Failed]);
        assert_eq!(
            outcome.deployment.failure_reason,
            Some(FailureReason::Capacity {
                requested: 5,
                ceiling: 4
            })
        );
        assert!(h.compute.running().is_empty());
        assert_eq!(h.lb.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tag_fails_in_provisioning() {
        let mut h = harness(8);
        let strict = SimRegistry::strict();
        strict.register_repository("orders", "registry.local/orders");
        let registry: Arc<dyn ContainerRegistry> = Arc::new(strict);
        h.services.registry = registry;

        let (m, _) = machine(&h, &orders(2), 1, "v9");
        let outcome = m.run().await;

        assert_eq!(outcome.deployment.state, DeploymentState::Failed);
        assert!(matches!(
            outcome.deployment.failure_reason,
            Some(FailureReason::Registry { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_fails() {
        let h = harness(8);
        h.compute.fail_launches(true);
        let (m, _) = machine(&h, &orders(2), 1, "v1");
        let outcome = m.run().await;

        assert_eq!(outcome.deployment.state, DeploymentState::Failed);
        assert!(matches!(
            outcome.deployment.failure_reason,
            Some(FailureReason::Launch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_validation_rolls_back() {
        let h = harness(8);
        let service = serving_v1(&h).await;
        h.probe.set_default(ProbeResult::Unhealthy);

        let (m, cancel) = machine(&h, &service, 2, "v2");
        let mut status = m.subscribe();
        let task = tokio::spawn(m.run());

        status
            .wait_for(|d| d.state == DeploymentState::Validating)
            .await
            .unwrap();
        assert!(cancel.cancel());

        let outcome = task.await.unwrap();
        assert_eq!(outcome.deployment.state, DeploymentState::RolledBack);
        assert_eq!(outcome.deployment.failure_reason, Some(FailureReason::Cancelled));
        assert!(!h.services.targets.contains(&green()));
        assert_eq!(h.lb.weights("orders").unwrap()[&blue()], 100);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_weighted_shift_restores_source() {
        let h = harness(8);
        let mut service = serving_v1(&h).await;
        service.plan = ShiftPlan::Weighted {
            steps: vec![
                ShiftStep {
                    weight: 10,
                    hold: Duration::from_secs(120),
                },
                ShiftStep {
                    weight: 50,
                    hold: Duration::from_secs(120),
                },
            ],
        };

        let (m, cancel) = machine(&h, &service, 2, "v2");
        let mut status = m.subscribe();
        let task = tokio::spawn(m.run());

        status
            .wait_for(|d| d.state == DeploymentState::Shifting)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.lb.weights("orders").unwrap()[&green()], 10);
        cancel.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.deployment.state, DeploymentState::RolledBack);
        assert_eq!(outcome.deployment.failure_reason, Some(FailureReason::Cancelled));
        let weights = h.lb.weights("orders").unwrap();
        assert_eq!(weights[&blue()], 100);
        for (_, applied) in h.lb.history() {
            assert_eq!(applied.values().map(|w| u32::from(*w)).sum::<u32>(), 100);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn routing_failure_rolls_back() {
        let h = harness(8);
        let service = serving_v1(&h).await;
        h.lb.fail_call(h.lb.call_count() + 1);

        let (m, _) = machine(&h, &service, 2, "v2");
        let outcome = m.run().await;

        assert_eq!(outcome.deployment.state, DeploymentState::RolledBack);
        assert!(matches!(
            outcome.deployment.failure_reason,
            Some(FailureReason::RoutingFailure { step: 1, .. })
        ));
        assert!(!h.services.targets.contains(&green()));
        assert_eq!(h.lb.weights("orders").unwrap()[&blue()], 100);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_teardown_failure_is_failed() {
        let h = harness(8);
        let service = serving_v1(&h).await;
        h.probe.set_default(ProbeResult::Failed);
        h.compute.fail_terminations_for_tag("v2");

        let (m, _) = machine(&h, &service, 2, "v2");
        let outcome = m.run().await;

        use DeploymentState::*;
        assert_eq!(
            states(&outcome.deployment),
            vec![Provisioning, Validating, RollingBack, Failed]
        );
        assert!(matches!(
            outcome.deployment.failure_reason,
            Some(FailureReason::Termination { .. })
        ));
        assert!(h.services.targets.contains(&green()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_revert_is_failed_and_keeps_routed_target() {
        let h = harness(8);
        let mut service = serving_v1(&h).await;
        service.plan = ShiftPlan::Weighted {
            steps: vec![ShiftStep {
                weight: 10,
                hold: Duration::from_secs(60),
            }],
        };

        let (m, cancel) = machine(&h, &service, 2, "v2");
        let mut status = m.subscribe();
        let task = tokio::spawn(m.run());

        status
            .wait_for(|d| d.state == DeploymentState::Shifting)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.lb.fail_calls_from(h.lb.call_count() + 1);
        cancel.cancel();

        let outcome = task.await.unwrap();
        use DeploymentState::*;
        assert_eq!(
            states(&outcome.deployment),
            vec![Provisioning, Validating, Shifting, RollingBack, Failed]
        );
        assert!(matches!(
            outcome.deployment.failure_reason,
            Some(FailureReason::RoutingFailure { step: 0, .. })
        ));
        assert!(outcome.stale_group.is_none());
        assert!(h.services.targets.contains(&green()));
        assert_eq!(h.compute.running_version("orders", "v2").len(), 2);
        let weights = h.lb.weights("orders").unwrap();
        assert_eq!((weights[&blue()], weights[&green()]), (90, 10));
        assert!(h.services.router.carries_traffic("orders", &green()));
    }

    #[tokio::test(start_paused = true)]
    async fn first_deployment_cancelled_mid_shift_clears_routes() {
        let h = harness(8);
        h.lb.set_ack_delay(Duration::from_secs(3));

        let (m, cancel) = machine(&h, &orders(2), 1, "v1");
        let mut status = m.subscribe();
        let task = tokio::spawn(m.run());

        status
            .wait_for(|d| d.state == DeploymentState::Shifting)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // The load balancer took the route but has not answered yet.
        assert_eq!(h.lb.weights("orders").unwrap()[&blue()], 100);
        cancel.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.deployment.state, DeploymentState::RolledBack);
        assert_eq!(outcome.deployment.failure_reason, Some(FailureReason::Cancelled));
        assert!(h.lb.weights("orders").is_none());
        assert!(!h.services.targets.contains(&blue()));
        assert!(h.compute.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_teardown_failure_still_succeeds() {
        let h = harness(8);
        let service = serving_v1(&h).await;
        h.compute.fail_terminations_for_tag("v1");

        let (m, _) = machine(&h, &service, 2, "v2");
        let outcome = m.run().await;

        assert_eq!(outcome.deployment.state, DeploymentState::Succeeded);
        assert_eq!(outcome.stale_group, Some(blue()));
        assert!(h.services.targets.contains(&blue()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_launches_nothing() {
        let h = harness(8);
        let (m, cancel) = machine(&h, &orders(2), 1, "v1");
        cancel.cancel();
        let outcome = m.run().await;

        use DeploymentState::*;
        assert_eq!(
            states(&outcome.deployment),
            vec![Provisioning, RollingBack, RolledBack]
        );
        assert!(h.compute.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn status_channel_sees_every_state_in_order() {
        let h = harness(8);
        let (m, _) = machine(&h, &orders(1), 1, "v1");
        let mut status = m.subscribe();
        let outcome = m.run().await;

        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), outcome.deployment);
        let at: Vec<u64> = outcome.deployment.transitions.iter().map(|t| t.at_ms).collect();
        assert!(at.windows(2).all(|w| w[0] <= w[1]));
    }
}
