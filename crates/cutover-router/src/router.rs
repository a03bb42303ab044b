//! Traffic router — moves weight from a source group to a target group.
//!
//! State per service is kept behind a std `RwLock` that is never held
//! across a load balancer call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use cutover_core::{GroupColor, GroupId, ShiftPlan, ShiftStep};
use cutover_platform::{LoadBalancer, Weights};

use crate::error::{RouterError, RouterResult};

/// Traffic split across a service's target groups.
///
/// An empty state means no traffic has ever been routed for the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingState {
    pub weights: Weights,
}

impl RoutingState {
    /// All traffic on one group.
    pub fn all_to(group: &GroupId) -> Self {
        let mut weights = Weights::new();
        weights.insert(group.clone(), 100);
        Self { weights }
    }

    /// `weight` percent on `to`, the rest on `from`. A missing source
    /// carries no entry.
    pub fn split(from: Option<&GroupId>, to: &GroupId, weight: u8) -> Self {
        let mut weights = Weights::new();
        weights.insert(to.clone(), weight);
        if let Some(from) = from {
            weights.insert(from.clone(), 100 - weight);
        }
        Self { weights }
    }

    pub fn weight_of(&self, group: &GroupId) -> u8 {
        self.weights.get(group).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.weights.values().map(|w| u32::from(*w)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Weights keyed by color, for display.
    pub fn by_color(&self) -> BTreeMap<GroupColor, u8> {
        self.weights.iter().map(|(g, w)| (g.color, *w)).collect()
    }
}

struct ServiceRouting {
    current: RoutingState,
    /// Pre-shift state, present while a shift is uncommitted.
    baseline: Option<RoutingState>,
    step_timeout: Duration,
    /// A load balancer call went out without a confirmed answer: the data
    /// plane may hold something other than `current`.
    in_doubt: bool,
}

impl Default for ServiceRouting {
    fn default() -> Self {
        Self {
            current: RoutingState::default(),
            baseline: None,
            step_timeout: Duration::from_secs(30),
            in_doubt: false,
        }
    }
}

/// Normalise a plan into concrete steps.
///
/// Weighted steps must be in 1..=100 and strictly increasing; a plan that
/// stops short of 100 gets a final 100 step appended.
pub fn plan_steps(plan: &ShiftPlan) -> RouterResult<Vec<ShiftStep>> {
    match plan {
        ShiftPlan::Atomic => Ok(vec![ShiftStep {
            weight: 100,
            hold: Duration::ZERO,
        }]),
        ShiftPlan::Weighted { steps } => {
            if steps.is_empty() {
                return Err(RouterError::InvalidPlan(
                    "weighted plan has no steps".to_string(),
                ));
            }
            let mut previous = 0u8;
            for (i, step) in steps.iter().enumerate() {
                if step.weight > 100 {
                    return Err(RouterError::InvalidPlan(format!(
                        "step {} weight {} exceeds 100",
                        i + 1,
                        step.weight
                    )));
                }
                if step.weight <= previous {
                    return Err(RouterError::InvalidPlan(format!(
                        "step {} weight {} does not increase on {}",
                        i + 1,
                        step.weight,
                        previous
                    )));
                }
                previous = step.weight;
            }
            let mut normalized = steps.clone();
            if previous < 100 {
                normalized.push(ShiftStep {
                    weight: 100,
                    hold: Duration::ZERO,
                });
            }
            Ok(normalized)
        }
    }
}

/// Applies traffic splits through a load balancer.
pub struct TrafficRouter {
    lb: Arc<dyn LoadBalancer>,
    services: RwLock<HashMap<String, ServiceRouting>>,
}

impl TrafficRouter {
    pub fn new(lb: Arc<dyn LoadBalancer>) -> Self {
        Self {
            lb,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Record an existing split without touching the load balancer, e.g.
    /// when restoring a service's active group after a restart.
    pub fn set_initial(&self, service_id: &str, state: RoutingState) {
        let mut services = self.services.write().expect("routing lock");
        let entry = services.entry(service_id.to_string()).or_default();
        entry.current = state;
        entry.baseline = None;
        entry.in_doubt = false;
    }

    /// Last split successfully applied for a service.
    pub fn routing_state(&self, service_id: &str) -> Option<RoutingState> {
        self.services
            .read()
            .expect("routing lock")
            .get(service_id)
            .map(|e| e.current.clone())
    }

    /// Whether `group` may be receiving traffic: it has weight in the
    /// recorded split, or a shift toward it is still unreverted.
    pub fn carries_traffic(&self, service_id: &str, group: &GroupId) -> bool {
        self.services
            .read()
            .expect("routing lock")
            .get(service_id)
            .is_some_and(|e| e.current.weight_of(group) > 0 || e.baseline.is_some())
    }

    /// Whether an uncommitted shift baseline exists.
    pub fn has_pending_shift(&self, service_id: &str) -> bool {
        self.services
            .read()
            .expect("routing lock")
            .get(service_id)
            .is_some_and(|e| e.baseline.is_some())
    }

    /// Shift traffic from `from` to `to` following `plan`.
    ///
    /// With no source group every intermediate step is skipped: the target
    /// goes straight to 100. On a failed or timed-out step the router
    /// reverts to the pre-shift split before reporting.
    pub async fn shift_traffic(
        &self,
        service_id: &str,
        from: Option<&GroupId>,
        to: &GroupId,
        plan: &ShiftPlan,
        step_timeout: Duration,
    ) -> RouterResult<RoutingState> {
        let mut steps = plan_steps(plan)?;
        if from.is_none() {
            steps.drain(..steps.len() - 1);
        }

        {
            let mut services = self.services.write().expect("routing lock");
            let entry = services.entry(service_id.to_string()).or_default();
            if entry.baseline.is_none() {
                entry.baseline = Some(entry.current.clone());
            }
            entry.step_timeout = step_timeout;
        }

        info!(
            service = service_id,
            from = ?from.map(ToString::to_string),
            to = %to,
            steps = steps.len(),
            "traffic shift started"
        );

        let total = steps.len();
        for (i, step) in steps.iter().enumerate() {
            let n = i + 1;
            let state = RoutingState::split(from, to, step.weight);

            self.mark_in_doubt(service_id);
            if let Err(reason) = self.apply(service_id, &state, step_timeout).await {
                warn!(service = service_id, step = n, %reason, "traffic step failed, reverting");
                if let Err(e) = self.revert(service_id).await {
                    error!(service = service_id, error = %e, "revert after failed step did not complete");
                }
                return Err(RouterError::RoutingFailure { step: n, reason });
            }
            self.record(service_id, state);
            debug!(service = service_id, step = n, weight = step.weight, "traffic step applied");

            if n < total && !step.hold.is_zero() {
                tokio::time::sleep(step.hold).await;
            }
        }

        info!(service = service_id, to = %to, "traffic shift complete");
        Ok(self.routing_state(service_id).unwrap_or_default())
    }

    /// Restore the pre-shift split. A no-op when no shift is pending.
    ///
    /// The baseline is pushed again whenever the data plane may differ
    /// from it, including after an unanswered or abandoned call. An empty
    /// baseline (nothing routed before the shift) clears the service's
    /// routes instead.
    ///
    /// On failure the recorded state stays at the last applied step and
    /// the baseline is kept, so the revert can be retried.
    pub async fn revert(&self, service_id: &str) -> RouterResult<()> {
        let (baseline, current, in_doubt, timeout) = {
            let services = self.services.read().expect("routing lock");
            match services.get(service_id) {
                Some(ServiceRouting {
                    current,
                    baseline: Some(baseline),
                    step_timeout,
                    in_doubt,
                }) => (baseline.clone(), current.clone(), *in_doubt, *step_timeout),
                _ => return Ok(()),
            }
        };

        if baseline != current || in_doubt {
            self.mark_in_doubt(service_id);
            let result = if baseline.is_empty() {
                self.clear(service_id, timeout).await
            } else {
                self.apply(service_id, &baseline, timeout).await
            };
            result.map_err(|reason| RouterError::Revert {
                service: service_id.to_string(),
                reason,
            })?;
        }

        let mut services = self.services.write().expect("routing lock");
        if let Some(entry) = services.get_mut(service_id) {
            entry.current = baseline;
            entry.baseline = None;
            entry.in_doubt = false;
        }
        info!(service = service_id, "traffic reverted");
        Ok(())
    }

    /// Accept the current split as the new baseline.
    pub fn commit(&self, service_id: &str) {
        if let Some(entry) = self
            .services
            .write()
            .expect("routing lock")
            .get_mut(service_id)
        {
            entry.baseline = None;
        }
        debug!(service = service_id, "traffic shift committed");
    }

    async fn apply(
        &self,
        service_id: &str,
        state: &RoutingState,
        timeout: Duration,
    ) -> Result<(), String> {
        match tokio::time::timeout(timeout, self.lb.set_weights(service_id, &state.weights)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("load balancer did not answer within {timeout:?}")),
        }
    }

    async fn clear(&self, service_id: &str, timeout: Duration) -> Result<(), String> {
        match tokio::time::timeout(timeout, self.lb.clear_routes(service_id)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("load balancer did not answer within {timeout:?}")),
        }
    }

    /// Set before every load balancer call; only a confirmed answer clears it.
    fn mark_in_doubt(&self, service_id: &str) {
        let mut services = self.services.write().expect("routing lock");
        services.entry(service_id.to_string()).or_default().in_doubt = true;
    }

    fn record(&self, service_id: &str, state: RoutingState) {
        let mut services = self.services.write().expect("routing lock");
        let entry = services.entry(service_id.to_string()).or_default();
        entry.current = state;
        entry.in_doubt = false;
    }
}
