//! Domain types for services, target groups, and deployments.
//!
//! All types serialize to JSON for the history store and the REST API.
//! Timestamps are unix milliseconds.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

/// Unique identifier for a registered service.
pub type ServiceId = String;

/// Unique identifier for a deployment attempt (`{service}-{sequence}`).
pub type DeploymentId = String;

/// Unique identifier for a running instance, assigned by the compute platform.
pub type InstanceId = String;

// ── Target groups ─────────────────────────────────────────────────

/// Which half of a blue/green pair a target group is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupColor {
    Blue,
    Green,
}

impl GroupColor {
    /// The opposite color.
    pub fn other(self) -> Self {
        match self {
            GroupColor::Blue => GroupColor::Green,
            GroupColor::Green => GroupColor::Blue,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupColor::Blue => "blue",
            GroupColor::Green => "green",
        }
    }
}

impl fmt::Display for GroupColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a target group: one color of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId {
    pub service_id: ServiceId,
    pub color: GroupColor,
}

impl GroupId {
    pub fn new(service_id: &str, color: GroupColor) -> Self {
        Self {
            service_id: service_id.to_string(),
            color,
        }
    }

    /// The other group of the same service.
    pub fn sibling(&self) -> Self {
        Self::new(&self.service_id, self.color.other())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.color)
    }
}

/// Health status as determined by probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// A running service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Reachable address (`ip:port`) used by health probes.
    pub address: String,
    pub health: HealthStatus,
}

// ── Images and versions ───────────────────────────────────────────

/// A pinned container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
    /// Content digest, when the registry pins one.
    pub digest: Option<String>,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// What the operator asks to deploy.
///
/// Deployment configuration travels with the request; `config_artifact`
/// is an opaque reference handed through to the instance spec untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSpec {
    pub tag: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub config_artifact: Option<String>,
}

impl VersionSpec {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            env: BTreeMap::new(),
            config_artifact: None,
        }
    }
}

/// Everything the compute platform needs to launch instances of one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub service_id: ServiceId,
    pub image: ImageReference,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub config_artifact: Option<String>,
}

// ── Services ──────────────────────────────────────────────────────

/// Health probing parameters for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// HTTP path to probe (e.g. "/health").
    pub path: String,
    pub interval: Duration,
    /// Timeout per probe.
    pub timeout: Duration,
    /// Consecutive failures before an instance is marked unhealthy.
    pub retries: u32,
    /// Minimum healthy fraction (0.0–1.0) for quorum.
    pub healthy_threshold: f64,
    /// How long quorum must hold. Defaults to `interval * retries`.
    pub sustain: Option<Duration>,
}

impl ProbeConfig {
    /// Effective sustain window.
    pub fn sustain(&self) -> Duration {
        self.sustain
            .unwrap_or_else(|| self.interval * self.retries.max(1))
    }

    /// Consecutive quorum-meeting snapshots needed to cover the sustain window.
    pub fn required_snapshots(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        let sustain = self.sustain().as_millis();
        (sustain.div_ceil(interval) as u32).max(1)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            retries: 3,
            healthy_threshold: 1.0,
            sustain: None,
        }
    }
}

/// One step of a weighted traffic shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftStep {
    /// Percentage of traffic on the new group after this step.
    pub weight: u8,
    /// How long to hold this split before the next step.
    pub hold: Duration,
}

/// How traffic moves from the old group to the new one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShiftPlan {
    /// Single-step 0 → 100 cutover.
    #[default]
    Atomic,
    /// Ordered canary-style steps.
    Weighted { steps: Vec<ShiftStep> },
}

/// The release currently serving traffic for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRelease {
    pub color: GroupColor,
    pub version: String,
    pub deployment_id: DeploymentId,
}

/// A registered, deployable service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: ServiceId,
    /// Image repository resolved through the container registry.
    pub image_repository: String,
    /// Container port instances listen on.
    pub port: u16,
    pub desired_count: u32,
    pub health: ProbeConfig,
    pub validation_timeout: Duration,
    pub shift_step_timeout: Duration,
    #[serde(default)]
    pub plan: ShiftPlan,
    /// Set by the orchestrator after each successful deployment.
    #[serde(default)]
    pub active: Option<ActiveRelease>,
}

impl ServiceSpec {
    /// A service with default probing and an atomic plan.
    pub fn new(id: &str, image_repository: &str, desired_count: u32) -> Self {
        Self {
            id: id.to_string(),
            image_repository: image_repository.to_string(),
            port: 80,
            desired_count,
            health: ProbeConfig::default(),
            validation_timeout: Duration::from_secs(300),
            shift_step_timeout: Duration::from_secs(30),
            plan: ShiftPlan::Atomic,
            active: None,
        }
    }

    /// Group the next deployment provisions into.
    pub fn next_color(&self) -> GroupColor {
        match &self.active {
            Some(active) => active.color.other(),
            None => GroupColor::Blue,
        }
    }
}

// ── Deployments ───────────────────────────────────────────────────

/// Lifecycle state of one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Provisioning,
    Validating,
    Shifting,
    Finalizing,
    RollingBack,
    Succeeded,
    RolledBack,
    Failed,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded | DeploymentState::RolledBack | DeploymentState::Failed
        )
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, next),
            (Provisioning, Validating)
                | (Provisioning, Failed)
                | (Provisioning, RollingBack)
                | (Validating, Shifting)
                | (Validating, RollingBack)
                | (Shifting, Finalizing)
                | (Shifting, RollingBack)
                | (Finalizing, Succeeded)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentState::Provisioning => "provisioning",
            DeploymentState::Validating => "validating",
            DeploymentState::Shifting => "shifting",
            DeploymentState::Finalizing => "finalizing",
            DeploymentState::RollingBack => "rolling_back",
            DeploymentState::Succeeded => "succeeded",
            DeploymentState::RolledBack => "rolled_back",
            DeploymentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a deployment left the happy path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Requested instance count exceeds the group ceiling.
    Capacity { requested: u32, ceiling: u32 },
    /// The image tag could not be resolved.
    Registry { message: String },
    /// The compute platform refused to launch instances.
    Launch { message: String },
    /// Quorum was not reached before the validation timeout.
    HealthCheckTimeout { healthy: u32, total: u32 },
    /// A traffic shift step failed or timed out.
    RoutingFailure { step: usize, message: String },
    /// An operator cancelled the deployment.
    Cancelled,
    /// Tearing down a target group failed.
    Termination { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Capacity { requested, ceiling } => {
                write!(f, "capacity exceeded: requested {requested}, ceiling {ceiling}")
            }
            FailureReason::Registry { message } => write!(f, "registry error: {message}"),
            FailureReason::Launch { message } => write!(f, "launch error: {message}"),
            FailureReason::HealthCheckTimeout { healthy, total } => {
                write!(f, "health check timeout: {healthy}/{total} healthy")
            }
            FailureReason::RoutingFailure { step, message } => {
                write!(f, "routing failure at step {step}: {message}")
            }
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Termination { message } => write!(f, "termination error: {message}"),
        }
    }
}

/// One entry in a deployment's transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: DeploymentState,
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

/// Snapshot of one deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub service_id: ServiceId,
    pub version: String,
    /// Group serving traffic before this deployment, if any.
    pub source_group: Option<GroupId>,
    pub target_group: GroupId,
    pub state: DeploymentState,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub failure_reason: Option<FailureReason>,
    pub transitions: Vec<Transition>,
}

impl Deployment {
    /// A freshly accepted deployment in `Provisioning`.
    pub fn new(
        id: &str,
        service_id: &str,
        version: &str,
        source_group: Option<GroupId>,
        target_group: GroupId,
    ) -> Self {
        let now = epoch_millis();
        Self {
            id: id.to_string(),
            service_id: service_id.to_string(),
            version: version.to_string(),
            source_group,
            target_group,
            state: DeploymentState::Provisioning,
            started_at_ms: now,
            ended_at_ms: None,
            failure_reason: None,
            transitions: vec![Transition {
                state: DeploymentState::Provisioning,
                at_ms: now,
                reason: None,
            }],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a transition, recording it in the log.
    ///
    /// The most recent reason becomes `failure_reason`; terminal states
    /// stamp `ended_at_ms`.
    pub fn transition(
        &mut self,
        next: DeploymentState,
        reason: Option<FailureReason>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        let now = epoch_millis();
        self.state = next;
        if reason.is_some() {
            self.failure_reason = reason.clone();
        }
        if next.is_terminal() {
            self.ended_at_ms = Some(now);
        }
        self.transitions.push(Transition {
            state: next,
            at_ms: now,
            reason,
        });
        Ok(())
    }

    /// Sequence number embedded in the id, used to order history.
    pub fn sequence(&self) -> u64 {
        self.id
            .rsplit('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

/// Build a deployment id from a service and its per-service sequence.
pub fn deployment_id(service_id: &str, sequence: u64) -> DeploymentId {
    format!("{service_id}-{sequence}")
}

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Deployment {
        Deployment::new(
            "orders-1",
            "orders",
            "v2",
            Some(GroupId::new("orders", GroupColor::Blue)),
            GroupId::new("orders", GroupColor::Green),
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut d = deployment();
        for next in [
            DeploymentState::Validating,
            DeploymentState::Shifting,
            DeploymentState::Finalizing,
            DeploymentState::Succeeded,
        ] {
            d.transition(next, None).unwrap();
        }
        assert!(d.is_terminal());
        assert!(d.ended_at_ms.is_some());
        assert_eq!(d.transitions.len(), 5);
        assert!(d.failure_reason.is_none());
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut d = deployment();
        d.transition(DeploymentState::Failed, Some(FailureReason::Capacity {
            requested: 9,
            ceiling: 4,
        }))
        .unwrap();

        let err = d.transition(DeploymentState::Validating, None).unwrap_err();
        assert_eq!(err.from, DeploymentState::Failed);
        assert_eq!(d.state, DeploymentState::Failed);
    }

    #[test]
    fn finalizing_cannot_roll_back() {
        assert!(!DeploymentState::Finalizing.can_transition_to(DeploymentState::RollingBack));
        assert!(DeploymentState::Shifting.can_transition_to(DeploymentState::RollingBack));
    }

    #[test]
    fn rollback_keeps_latest_reason() {
        let mut d = deployment();
        d.transition(DeploymentState::Validating, None).unwrap();
        d.transition(
            DeploymentState::RollingBack,
            Some(FailureReason::HealthCheckTimeout { healthy: 0, total: 2 }),
        )
        .unwrap();
        d.transition(DeploymentState::RolledBack, None).unwrap();

        assert_eq!(
            d.failure_reason,
            Some(FailureReason::HealthCheckTimeout { healthy: 0, total: 2 })
        );
    }

    #[test]
    fn sequence_parsed_from_id() {
        assert_eq!(deployment().sequence(), 1);
        assert_eq!(deployment_id("api-eu", 12), "api-eu-12");
    }

    #[test]
    fn required_snapshots_defaults_to_retries() {
        let cfg = ProbeConfig {
            interval: Duration::from_secs(1),
            retries: 3,
            ..Default::default()
        };
        assert_eq!(cfg.sustain(), Duration::from_secs(3));
        assert_eq!(cfg.required_snapshots(), 3);

        let cfg = ProbeConfig {
            interval: Duration::from_secs(2),
            sustain: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert_eq!(cfg.required_snapshots(), 3);
    }

    #[test]
    fn next_color_alternates() {
        let mut svc = ServiceSpec::new("orders", "registry.local/orders", 2);
        assert_eq!(svc.next_color(), GroupColor::Blue);
        svc.active = Some(ActiveRelease {
            color: GroupColor::Blue,
            version: "v1".to_string(),
            deployment_id: "orders-1".to_string(),
        });
        assert_eq!(svc.next_color(), GroupColor::Green);
    }

    #[test]
    fn image_reference_display() {
        let image = ImageReference {
            repository: "registry.local/orders".to_string(),
            tag: "v2".to_string(),
            digest: Some("sha256:abc".to_string()),
        };
        assert_eq!(image.to_string(), "registry.local/orders:v2@sha256:abc");
    }

    #[test]
    fn failure_reason_serializes_tagged() {
        let json = serde_json::to_value(FailureReason::Cancelled).unwrap();
        assert_eq!(json["kind"], "cancelled");
    }
}
