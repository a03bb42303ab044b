//! cutover-core — shared domain types and configuration for Cutover.
//!
//! Every other crate in the workspace speaks in these types: services and
//! their probe settings, target group identities, version requests, and the
//! `Deployment` snapshot that the state machine mutates and the history
//! store persists.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::CutoverConfig;
pub use duration::parse_duration;
pub use error::{ConfigError, TransitionError};
pub use types::*;
