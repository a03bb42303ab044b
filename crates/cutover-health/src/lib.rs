//! cutover-health — health probing for target groups.
//!
//! # Architecture
//!
//! ```text
//! HealthProber::watch(group, config)
//!   └── background task per subscription
//!       ├── membership watch (instance set from TargetGroupModel)
//!       ├── HealthTracker per instance (consecutive failures vs retries)
//!       ├── Probe::probe() → ProbeResult   (HttpProbe / ScriptedProbe)
//!       ├── set_instance_health() back into the model
//!       └── watch::Sender<HealthSnapshot>  (latest only, drop-oldest)
//! ```
//!
//! `QuorumGate` turns the snapshot stream into a yes/no: the healthy
//! fraction has to meet the threshold for enough consecutive snapshots to
//! cover the sustain window.

pub mod checker;
pub mod prober;
pub mod quorum;

pub use checker::{HealthTracker, HttpProbe, Probe, ProbeResult, ScriptedProbe};
pub use prober::{HealthProber, HealthSnapshot, HealthSubscription, InstanceHealth};
pub use quorum::QuorumGate;
