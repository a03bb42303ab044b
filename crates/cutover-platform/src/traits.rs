//! Collaborator traits.
//!
//! Methods return boxed futures so the traits stay object-safe and can be
//! shared as `Arc<dyn …>` across deployment tasks.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use cutover_core::{GroupId, ImageReference, Instance, InstanceId, InstanceSpec};

use crate::error::PlatformResult;

/// Boxed, sendable future returned by collaborator calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Traffic percentage per target group. Values sum to 100.
pub type Weights = BTreeMap<GroupId, u8>;

/// Resolves version tags to pinned images.
pub trait ContainerRegistry: Send + Sync {
    fn resolve_image<'a>(
        &'a self,
        service_id: &'a str,
        tag: &'a str,
    ) -> BoxFuture<'a, PlatformResult<ImageReference>>;

    /// Called when a service is registered so the registry knows which
    /// repository its tags live in.
    fn track_service(&self, _service_id: &str, _repository: &str) {}
}

/// Runs instances (a task-execution cluster or similar).
pub trait ComputePlatform: Send + Sync {
    /// Launch `count` instances of `spec`. All-or-nothing: on error no
    /// instance is left running.
    fn launch_instances<'a>(
        &'a self,
        spec: &'a InstanceSpec,
        count: u32,
    ) -> BoxFuture<'a, PlatformResult<Vec<Instance>>>;

    fn terminate_instances<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
    ) -> BoxFuture<'a, PlatformResult<()>>;
}

/// The load balancer data plane in front of a service's target groups.
pub trait LoadBalancer: Send + Sync {
    fn set_weights<'a>(
        &'a self,
        router_id: &'a str,
        weights: &'a Weights,
    ) -> BoxFuture<'a, PlatformResult<()>>;

    /// Drop every route for `router_id`: no group receives traffic.
    fn clear_routes<'a>(&'a self, router_id: &'a str) -> BoxFuture<'a, PlatformResult<()>>;
}
