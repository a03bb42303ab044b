//! cutover-rollout — drives one blue/green deployment to a terminal state.
//!
//! ```text
//! Provisioning ──▶ Validating ──▶ Shifting ──▶ Finalizing ──▶ Succeeded
//!      │               │              │
//!      │               └──────┬───────┘
//!      ▼                      ▼
//!    Failed ◀──────────── RollingBack ──▶ RolledBack
//! ```
//!
//! A `DeploymentMachine` owns the new target group and the service's
//! routing for as long as it runs. Every transition is published on a
//! `watch` channel so readers always see a whole `Deployment` snapshot.

pub mod cancel;
pub mod machine;

pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use machine::{DeploymentMachine, DeploymentOutcome, Services};
