//! In-process collaborators with failure injection.
//!
//! Nothing here touches the network. The simulated compute platform hands
//! out addresses in `10.0.0.0/16`, the registry derives a stable digest from
//! the image name, and the load balancer just remembers the weights it was
//! given (and every call, so tests can check invariants over the history).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use cutover_core::{HealthStatus, ImageReference, Instance, InstanceId, InstanceSpec};

use crate::error::{PlatformError, PlatformResult};
use crate::traits::{BoxFuture, ComputePlatform, ContainerRegistry, LoadBalancer, Weights};

// ── Registry ──────────────────────────────────────────────────────

/// Registry that resolves tags for known repositories.
///
/// Permissive by default: any tag resolves. In strict mode only tags
/// passed to `publish` resolve.
pub struct SimRegistry {
    repositories: RwLock<HashMap<String, String>>,
    published: RwLock<HashMap<String, HashSet<String>>>,
    strict: bool,
}

impl SimRegistry {
    pub fn new() -> Self {
        Self {
            repositories: RwLock::new(HashMap::new()),
            published: RwLock::new(HashMap::new()),
            strict: false,
        }
    }

    /// A registry that only resolves published tags.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    pub fn register_repository(&self, service_id: &str, repository: &str) {
        self.repositories
            .write()
            .expect("repositories lock")
            .insert(service_id.to_string(), repository.to_string());
    }

    pub fn publish(&self, service_id: &str, tag: &str) {
        self.published
            .write()
            .expect("published lock")
            .entry(service_id.to_string())
            .or_default()
            .insert(tag.to_string());
    }
}

impl Default for SimRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRegistry for SimRegistry {
    fn resolve_image<'a>(
        &'a self,
        service_id: &'a str,
        tag: &'a str,
    ) -> BoxFuture<'a, PlatformResult<ImageReference>> {
        Box::pin(async move {
            let repository = self
                .repositories
                .read()
                .expect("repositories lock")
                .get(service_id)
                .cloned()
                .ok_or_else(|| PlatformError::UnknownRepository(service_id.to_string()))?;

            if self.strict {
                let published = self.published.read().expect("published lock");
                let known = published
                    .get(service_id)
                    .is_some_and(|tags| tags.contains(tag));
                if !known {
                    return Err(PlatformError::TagNotFound {
                        service: service_id.to_string(),
                        tag: tag.to_string(),
                    });
                }
            }

            let digest = Sha256::digest(format!("{repository}:{tag}").as_bytes());
            Ok(ImageReference {
                repository,
                tag: tag.to_string(),
                digest: Some(format!("sha256:{}", hex::encode(digest))),
            })
        })
    }

    fn track_service(&self, service_id: &str, repository: &str) {
        self.register_repository(service_id, repository);
    }
}

// ── Compute ───────────────────────────────────────────────────────

/// Compute platform that keeps launched instances in a map.
pub struct SimCompute {
    running: Mutex<BTreeMap<InstanceId, InstanceSpec>>,
    next_id: AtomicU64,
    fail_launches: Mutex<bool>,
    /// Image tags whose instances refuse to terminate.
    stuck_tags: Mutex<HashSet<String>>,
    launch_delay: Mutex<Duration>,
    terminate_delay: Mutex<Duration>,
}

impl SimCompute {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            fail_launches: Mutex::new(false),
            stuck_tags: Mutex::new(HashSet::new()),
            launch_delay: Mutex::new(Duration::ZERO),
            terminate_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every subsequent launch fail.
    pub fn fail_launches(&self, fail: bool) {
        *self.fail_launches.lock().expect("fail_launches lock") = fail;
    }

    /// Make termination of instances running `tag` fail.
    pub fn fail_terminations_for_tag(&self, tag: &str) {
        self.stuck_tags
            .lock()
            .expect("stuck_tags lock")
            .insert(tag.to_string());
    }

    /// Let instances running `tag` terminate again.
    pub fn clear_termination_failures(&self) {
        self.stuck_tags.lock().expect("stuck_tags lock").clear();
    }

    /// Delay every launch, to widen the provisioning window.
    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock().expect("launch_delay lock") = delay;
    }

    /// Delay every termination, to widen the teardown window.
    pub fn set_terminate_delay(&self, delay: Duration) {
        *self.terminate_delay.lock().expect("terminate_delay lock") = delay;
    }

    /// Ids of all running instances.
    pub fn running(&self) -> Vec<InstanceId> {
        self.running
            .lock()
            .expect("running lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Ids of running instances of one service version.
    pub fn running_version(&self, service_id: &str, tag: &str) -> Vec<InstanceId> {
        self.running
            .lock()
            .expect("running lock")
            .iter()
            .filter(|(_, spec)| spec.service_id == service_id && spec.image.tag == tag)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl Default for SimCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputePlatform for SimCompute {
    fn launch_instances<'a>(
        &'a self,
        spec: &'a InstanceSpec,
        count: u32,
    ) -> BoxFuture<'a, PlatformResult<Vec<Instance>>> {
        Box::pin(async move {
            let delay = *self.launch_delay.lock().expect("launch_delay lock");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if *self.fail_launches.lock().expect("fail_launches lock") {
                return Err(PlatformError::Launch(format!(
                    "no capacity for {}",
                    spec.image
                )));
            }

            let mut running = self.running.lock().expect("running lock");
            let mut launched = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let n = self.next_id.fetch_add(1, Ordering::Relaxed);
                let id = format!("i-{n:08x}");
                let address = format!("10.0.{}.{}:{}", (n >> 8) & 0xff, n & 0xff, spec.port);
                running.insert(id.clone(), spec.clone());
                launched.push(Instance {
                    id,
                    address,
                    health: HealthStatus::Unknown,
                });
            }
            debug!(service = %spec.service_id, image = %spec.image, count, "simulated launch");
            Ok(launched)
        })
    }

    fn terminate_instances<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
    ) -> BoxFuture<'a, PlatformResult<()>> {
        Box::pin(async move {
            let delay = *self.terminate_delay.lock().expect("terminate_delay lock");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let stuck = self.stuck_tags.lock().expect("stuck_tags lock").clone();
            let mut running = self.running.lock().expect("running lock");

            for id in instance_ids {
                if let Some(spec) = running.get(id) {
                    if stuck.contains(&spec.image.tag) {
                        return Err(PlatformError::Terminate(format!(
                            "instance {id} ({}) did not stop",
                            spec.image
                        )));
                    }
                }
            }
            for id in instance_ids {
                running.remove(id);
            }
            debug!(count = instance_ids.len(), "simulated terminate");
            Ok(())
        })
    }
}

// ── Load balancer ─────────────────────────────────────────────────

/// Load balancer data plane that records every weight change.
pub struct SimLoadBalancer {
    current: Mutex<HashMap<String, Weights>>,
    applied: Mutex<Vec<(String, Weights)>>,
    calls: AtomicUsize,
    /// 1-based call numbers that fail.
    failing_calls: Mutex<HashSet<usize>>,
    /// Every call from this 1-based number on fails.
    failing_from: Mutex<Option<usize>>,
    delay: Mutex<Duration>,
    /// Weights are applied at once but the answer arrives this late.
    ack_delay: Mutex<Duration>,
}

impl SimLoadBalancer {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            failing_calls: Mutex::new(HashSet::new()),
            failing_from: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            ack_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Fail the `n`th call (1-based, counted from creation).
    pub fn fail_call(&self, n: usize) {
        self.failing_calls.lock().expect("failing_calls lock").insert(n);
    }

    /// Fail every call from the `n`th on.
    pub fn fail_calls_from(&self, n: usize) {
        *self.failing_from.lock().expect("failing_from lock") = Some(n);
    }

    /// Delay every call, to exercise step timeouts and cancellation.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = delay;
    }

    /// Apply weights immediately but answer only after `delay`.
    pub fn set_ack_delay(&self, delay: Duration) {
        *self.ack_delay.lock().expect("ack_delay lock") = delay;
    }

    /// Weights currently applied for a router.
    pub fn weights(&self, router_id: &str) -> Option<Weights> {
        self.current
            .lock()
            .expect("current lock")
            .get(router_id)
            .cloned()
    }

    /// Every successfully applied weight map, in order.
    pub fn history(&self) -> Vec<(String, Weights)> {
        self.applied.lock().expect("applied lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for SimLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLoadBalancer {
    /// Count the call, wait out the configured delay, and apply failures.
    async fn admit(&self, router_id: &str) -> PlatformResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock().expect("delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing_from = *self.failing_from.lock().expect("failing_from lock");
        let failing = self
            .failing_calls
            .lock()
            .expect("failing_calls lock")
            .contains(&call)
            || failing_from.is_some_and(|from| call >= from);
        if failing {
            return Err(PlatformError::LoadBalancer(format!(
                "call {call} for {router_id} rejected"
            )));
        }
        Ok(())
    }

    async fn acknowledge(&self) {
        let delay = *self.ack_delay.lock().expect("ack_delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl LoadBalancer for SimLoadBalancer {
    fn set_weights<'a>(
        &'a self,
        router_id: &'a str,
        weights: &'a Weights,
    ) -> BoxFuture<'a, PlatformResult<()>> {
        Box::pin(async move {
            self.admit(router_id).await?;

            let total: u32 = weights.values().map(|w| u32::from(*w)).sum();
            if total != 100 {
                return Err(PlatformError::LoadBalancer(format!(
                    "weights for {router_id} sum to {total}"
                )));
            }

            self.current
                .lock()
                .expect("current lock")
                .insert(router_id.to_string(), weights.clone());
            self.applied
                .lock()
                .expect("applied lock")
                .push((router_id.to_string(), weights.clone()));
            self.acknowledge().await;
            Ok(())
        })
    }

    fn clear_routes<'a>(&'a self, router_id: &'a str) -> BoxFuture<'a, PlatformResult<()>> {
        Box::pin(async move {
            self.admit(router_id).await?;
            self.current.lock().expect("current lock").remove(router_id);
            debug!(router = router_id, "routes cleared");
            self.acknowledge().await;
            Ok(())
        })
    }
}
