//! TargetGroupModel — owns every live target group.
//!
//! The model never holds a lock across a platform call: instances are
//! launched first and the group is registered afterwards, and termination
//! only unregisters the group once the platform confirms.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use cutover_core::{GroupId, HealthStatus, ImageReference, Instance, InstanceSpec};
use cutover_platform::ComputePlatform;

use crate::error::{TargetError, TargetResult};

/// Snapshot of a target group.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroup {
    pub id: GroupId,
    pub version: String,
    pub image: ImageReference,
    pub instances: Vec<Instance>,
    pub created_at_ms: u64,
}

impl TargetGroup {
    /// Instances currently reported healthy.
    pub fn healthy_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.health == HealthStatus::Healthy)
            .count()
    }
}

struct GroupEntry {
    group: TargetGroup,
    /// Fires when the instance set changes (not on health updates).
    members: watch::Sender<Vec<Instance>>,
}

/// Registry of live target groups, backed by a compute platform.
pub struct TargetGroupModel {
    compute: Arc<dyn ComputePlatform>,
    max_group_size: u32,
    groups: RwLock<HashMap<GroupId, GroupEntry>>,
}

impl TargetGroupModel {
    pub fn new(compute: Arc<dyn ComputePlatform>, max_group_size: u32) -> Self {
        Self {
            compute,
            max_group_size,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Launch `count` instances of `spec` and register them as `group_id`.
    ///
    /// The capacity ceiling is checked before anything is launched.
    pub async fn create(
        &self,
        group_id: GroupId,
        version: &str,
        spec: &InstanceSpec,
        count: u32,
    ) -> TargetResult<TargetGroup> {
        if count == 0 || count > self.max_group_size {
            return Err(TargetError::Capacity {
                requested: count,
                ceiling: self.max_group_size,
            });
        }
        if self.groups.read().expect("groups lock").contains_key(&group_id) {
            return Err(TargetError::AlreadyExists(group_id));
        }

        let instances = self
            .compute
            .launch_instances(spec, count)
            .await
            .map_err(TargetError::Launch)?;

        let group = TargetGroup {
            id: group_id.clone(),
            version: version.to_string(),
            image: spec.image.clone(),
            instances: instances.clone(),
            created_at_ms: cutover_core::epoch_millis(),
        };
        let (members, _) = watch::channel(instances);

        let inserted = {
            let mut groups = self.groups.write().expect("groups lock");
            if groups.contains_key(&group_id) {
                false
            } else {
                groups.insert(
                    group_id.clone(),
                    GroupEntry {
                        group: group.clone(),
                        members,
                    },
                );
                true
            }
        };
        if !inserted {
            // Lost a race with another create for the same group; give the
            // instances back before reporting.
            let ids: Vec<_> = group.instances.iter().map(|i| i.id.clone()).collect();
            if let Err(e) = self.compute.terminate_instances(&ids).await {
                warn!(group = %group_id, error = %e, "failed to release duplicate instances");
            }
            return Err(TargetError::AlreadyExists(group_id));
        }
        info!(group = %group_id, version, count, image = %spec.image, "target group created");
        Ok(group)
    }

    /// Terminate every instance of a group and forget it.
    ///
    /// On failure the group stays registered so termination can be retried.
    pub async fn terminate(&self, group_id: &GroupId) -> TargetResult<()> {
        let ids: Vec<_> = {
            let groups = self.groups.read().expect("groups lock");
            let entry = groups
                .get(group_id)
                .ok_or_else(|| TargetError::GroupNotFound(group_id.clone()))?;
            entry.group.instances.iter().map(|i| i.id.clone()).collect()
        };

        self.compute
            .terminate_instances(&ids)
            .await
            .map_err(|source| TargetError::Termination {
                group: group_id.clone(),
                source,
            })?;

        if let Some(entry) = self.groups.write().expect("groups lock").remove(group_id) {
            entry.members.send_replace(Vec::new());
        }
        info!(group = %group_id, count = ids.len(), "target group terminated");
        Ok(())
    }

    /// Snapshot of a group.
    pub fn get(&self, group_id: &GroupId) -> Option<TargetGroup> {
        self.groups
            .read()
            .expect("groups lock")
            .get(group_id)
            .map(|e| e.group.clone())
    }

    pub fn contains(&self, group_id: &GroupId) -> bool {
        self.groups.read().expect("groups lock").contains_key(group_id)
    }

    /// Instances of a group, with their latest health.
    pub fn list_instances(&self, group_id: &GroupId) -> TargetResult<Vec<Instance>> {
        self.groups
            .read()
            .expect("groups lock")
            .get(group_id)
            .map(|e| e.group.instances.clone())
            .ok_or_else(|| TargetError::GroupNotFound(group_id.clone()))
    }

    /// Record a probe verdict for one instance.
    pub fn set_instance_health(&self, instance_id: &str, status: HealthStatus) -> TargetResult<()> {
        let mut groups = self.groups.write().expect("groups lock");
        for entry in groups.values_mut() {
            if let Some(inst) = entry
                .group
                .instances
                .iter_mut()
                .find(|i| i.id == instance_id)
            {
                if inst.health != status {
                    debug!(group = %entry.group.id, instance = instance_id, ?status, "instance health changed");
                }
                inst.health = status;
                return Ok(());
            }
        }
        Err(TargetError::InstanceNotFound(instance_id.to_string()))
    }

    /// Drop an instance the platform reported gone, notifying watchers.
    pub fn remove_instance(&self, instance_id: &str) -> TargetResult<()> {
        let mut groups = self.groups.write().expect("groups lock");
        for entry in groups.values_mut() {
            let before = entry.group.instances.len();
            entry.group.instances.retain(|i| i.id != instance_id);
            if entry.group.instances.len() != before {
                entry.members.send_replace(entry.group.instances.clone());
                warn!(group = %entry.group.id, instance = instance_id, "instance left target group");
                return Ok(());
            }
        }
        Err(TargetError::InstanceNotFound(instance_id.to_string()))
    }

    /// Subscribe to instance-set changes of a group.
    pub fn subscribe(&self, group_id: &GroupId) -> TargetResult<watch::Receiver<Vec<Instance>>> {
        self.groups
            .read()
            .expect("groups lock")
            .get(group_id)
            .map(|e| e.members.subscribe())
            .ok_or_else(|| TargetError::GroupNotFound(group_id.clone()))
    }

    /// All live groups of a service.
    pub fn groups_for_service(&self, service_id: &str) -> Vec<TargetGroup> {
        let mut groups: Vec<_> = self
            .groups
            .read()
            .expect("groups lock")
            .values()
            .filter(|e| e.group.id.service_id == service_id)
            .map(|e| e.group.clone())
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }
}
