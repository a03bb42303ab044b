//! cutover-platform — the narrow interfaces Cutover drives.
//!
//! The orchestrator never talks to a cloud provider directly. Everything
//! outside the process goes through three traits:
//!
//! - **`ContainerRegistry`** — pins a version tag to an image reference
//! - **`ComputePlatform`** — launches and terminates instances
//! - **`LoadBalancer`** — applies traffic weights to target groups
//!
//! The `sim` module carries in-process implementations with failure
//! injection, used by the daemon's simulated mode and by tests.

pub mod error;
pub mod sim;
pub mod traits;

pub use error::{PlatformError, PlatformResult};
pub use sim::{SimCompute, SimLoadBalancer, SimRegistry};
pub use traits::{BoxFuture, ComputePlatform, ContainerRegistry, LoadBalancer, Weights};
