//! Health prober — background task that probes every instance of a
//! target group and publishes aggregate snapshots.
//!
//! Snapshots go out over a `watch` channel: a slow consumer only ever
//! sees the latest one. Sequence numbers let it notice what it skipped.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use cutover_core::{GroupId, HealthStatus, Instance, InstanceId, ProbeConfig};
use cutover_targets::{TargetGroupModel, TargetResult};

use crate::checker::{HealthTracker, Probe, ProbeResult};

/// Health of one instance at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceHealth {
    pub instance_id: InstanceId,
    pub status: HealthStatus,
}

/// Aggregate health of a target group after one probe round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub group_id: GroupId,
    /// Strictly increasing per subscription, starting at 1.
    pub sequence: u64,
    pub taken_at_ms: u64,
    pub instances: Vec<InstanceHealth>,
    pub healthy: usize,
    pub total: usize,
}

impl HealthSnapshot {
    /// Healthy share of the group, 0.0 for an empty group.
    pub fn healthy_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.healthy as f64 / self.total as f64
        }
    }
}

/// Starts probe loops over target groups.
#[derive(Clone)]
pub struct HealthProber {
    targets: Arc<TargetGroupModel>,
    probe: Arc<dyn Probe>,
}

impl HealthProber {
    pub fn new(targets: Arc<TargetGroupModel>, probe: Arc<dyn Probe>) -> Self {
        Self { targets, probe }
    }

    /// Begin probing `group_id` every `config.interval`.
    ///
    /// Probing stops when the returned subscription is cancelled or dropped.
    pub fn watch(&self, group_id: &GroupId, config: &ProbeConfig) -> TargetResult<HealthSubscription> {
        let members = self.targets.subscribe(group_id)?;
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = ProbeLoop {
            group_id: group_id.clone(),
            config: Arc::new(config.clone()),
            targets: self.targets.clone(),
            probe: self.probe.clone(),
            members,
            snapshots: snapshot_tx,
        };
        let handle = tokio::spawn(ctx.run(shutdown_rx));

        info!(group = %group_id, interval = ?config.interval, path = %config.path, "health prober started");

        Ok(HealthSubscription {
            group_id: group_id.clone(),
            snapshots: snapshot_rx,
            shutdown_tx,
            handle,
        })
    }
}

/// Live stream of snapshots for one group.
pub struct HealthSubscription {
    group_id: GroupId,
    snapshots: watch::Receiver<Option<HealthSnapshot>>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HealthSubscription {
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Wait for a snapshot newer than the last one returned.
    ///
    /// Returns `None` once the probe loop has stopped.
    pub async fn next(&mut self) -> Option<HealthSnapshot> {
        loop {
            if self.snapshots.changed().await.is_err() {
                return None;
            }
            if let Some(snapshot) = self.snapshots.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    /// Most recent snapshot without waiting.
    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Stop probing. No snapshot is delivered afterwards.
    pub fn cancel(self) {}
}

impl Drop for HealthSubscription {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        debug!(group = %self.group_id, "health prober stopped");
    }
}

struct ProbeLoop {
    group_id: GroupId,
    config: Arc<ProbeConfig>,
    targets: Arc<TargetGroupModel>,
    probe: Arc<dyn Probe>,
    members: watch::Receiver<Vec<Instance>>,
    snapshots: watch::Sender<Option<HealthSnapshot>>,
}

impl ProbeLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut trackers: HashMap<InstanceId, HealthTracker> = HashMap::new();
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(group = %self.group_id, "probe loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    sequence += 1;
                    let snapshot = self.probe_round(sequence, &mut trackers).await;
                    trace!(
                        group = %self.group_id,
                        sequence,
                        healthy = snapshot.healthy,
                        total = snapshot.total,
                        "health snapshot"
                    );
                    if self.snapshots.send(Some(snapshot)).is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn probe_round(
        &mut self,
        sequence: u64,
        trackers: &mut HashMap<InstanceId, HealthTracker>,
    ) -> HealthSnapshot {
        let instances = self.members.borrow_and_update().clone();
        trackers.retain(|id, _| instances.iter().any(|i| &i.id == id));

        let mut probes = JoinSet::new();
        for instance in instances.iter().cloned() {
            let probe = self.probe.clone();
            let config = self.config.clone();
            probes.spawn(async move {
                let result = probe.probe(&instance, &config).await;
                (instance.id, result)
            });
        }

        let mut results: HashMap<InstanceId, ProbeResult> = HashMap::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok((id, result)) = joined {
                results.insert(id, result);
            }
        }

        let mut healthy = 0;
        let mut statuses = Vec::with_capacity(instances.len());
        for instance in &instances {
            let tracker = trackers
                .entry(instance.id.clone())
                .or_insert_with(|| HealthTracker::new(&self.config));
            // A panicked probe counts as a failed one.
            let result = results
                .get(&instance.id)
                .copied()
                .unwrap_or(ProbeResult::Failed);
            let status = tracker.record(result);
            if status == HealthStatus::Healthy {
                healthy += 1;
            }
            if let Err(e) = self.targets.set_instance_health(&instance.id, status) {
                debug!(group = %self.group_id, error = %e, "instance gone before health update");
            }
            statuses.push(InstanceHealth {
                instance_id: instance.id.clone(),
                status,
            });
        }

        HealthSnapshot {
            group_id: self.group_id.clone(),
            sequence,
            taken_at_ms: cutover_core::epoch_millis(),
            instances: statuses,
            healthy,
            total: instances.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use cutover_core::{GroupColor, ImageReference, InstanceSpec};
    use cutover_platform::SimCompute;

    use crate::checker::ScriptedProbe;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            service_id: "orders".to_string(),
            image: ImageReference {
                repository: "registry.local/orders".to_string(),
                tag: "v2".to_string(),
                digest: None,
            },
            port: 80,
            env: BTreeMap::new(),
            config_artifact: None,
        }
    }

    fn config() -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_secs(1),
            retries: 2,
            ..Default::default()
        }
    }

    async fn setup(count: u32, probe: Arc<ScriptedProbe>) -> (Arc<TargetGroupModel>, HealthProber, GroupId) {
        let targets = Arc::new(TargetGroupModel::new(Arc::new(SimCompute::new()), 8));
        let group = GroupId::new("orders", GroupColor::Green);
        targets.create(group.clone(), "v2", &spec(), count).await.unwrap();
        let prober = HealthProber::new(targets.clone(), probe);
        (targets, prober, group)
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_report_healthy_instances() {
        let probe = Arc::new(ScriptedProbe::always(ProbeResult::Healthy));
        let (targets, prober, group) = setup(2, probe).await;

        let mut sub = prober.watch(&group, &config()).unwrap();
        let first = sub.next().await.unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.total, 2);
        assert_eq!(first.healthy, 2);
        assert_eq!(first.healthy_fraction(), 1.0);
        assert_eq!(targets.get(&group).unwrap().healthy_count(), 2);

        let second = sub.next().await.unwrap();
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_need_retries_before_unhealthy() {
        let probe = Arc::new(ScriptedProbe::always(ProbeResult::Healthy));
        let (_, prober, group) = setup(2, probe.clone()).await;
        let mut sub = prober.watch(&group, &config()).unwrap();
        assert_eq!(sub.next().await.unwrap().healthy, 2);

        probe.set_default(ProbeResult::Failed);
        assert_eq!(sub.next().await.unwrap().healthy, 2);
        let third = sub.next().await.unwrap();
        assert_eq!(third.healthy, 0);
        assert!(third.instances.iter().all(|i| i.status == HealthStatus::Unhealthy));
    }

    #[tokio::test(start_paused = true)]
    async fn membership_changes_are_picked_up() {
        let probe = Arc::new(ScriptedProbe::always(ProbeResult::Healthy));
        let (targets, prober, group) = setup(3, probe).await;
        let mut sub = prober.watch(&group, &config()).unwrap();
        assert_eq!(sub.next().await.unwrap().total, 3);

        let gone = targets.get(&group).unwrap().instances[0].id.clone();
        targets.remove_instance(&gone).unwrap();

        let snapshot = sub.next().await.unwrap();
        assert_eq!(snapshot.total, 2);
        assert!(snapshot.instances.iter().all(|i| i.instance_id != gone));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_sees_only_latest() {
        let probe = Arc::new(ScriptedProbe::always(ProbeResult::Healthy));
        let (_, prober, group) = setup(1, probe).await;
        let mut sub = prober.watch(&group, &config()).unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let snapshot = sub.next().await.unwrap();
        assert_eq!(snapshot.sequence, 3);
        assert_eq!(sub.latest().unwrap().sequence, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_probing() {
        let probe = Arc::new(ScriptedProbe::always(ProbeResult::Healthy));
        let (_, prober, group) = setup(2, probe.clone()).await;
        let mut sub = prober.watch(&group, &config()).unwrap();
        sub.next().await.unwrap();

        sub.cancel();
        let calls = probe.calls();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.calls(), calls);
    }

    #[tokio::test]
    async fn watch_unknown_group_fails() {
        let probe = Arc::new(ScriptedProbe::always(ProbeResult::Healthy));
        let targets = Arc::new(TargetGroupModel::new(Arc::new(SimCompute::new()), 8));
        let prober = HealthProber::new(targets, probe);
        assert!(prober
            .watch(&GroupId::new("orders", GroupColor::Blue), &config())
            .is_err());
    }
}
