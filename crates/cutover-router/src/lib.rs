//! cutover-router — traffic weights between a service's target groups.
//!
//! The router remembers, per service, the weights last applied to the load
//! balancer and the pre-shift baseline. A shift walks the plan's steps,
//! recording each applied split, and falls back to the baseline when a
//! step fails. Every split handed to the load balancer sums to 100.

pub mod error;
pub mod router;

pub use error::{RouterError, RouterResult};
pub use router::{RoutingState, TrafficRouter, plan_steps};
