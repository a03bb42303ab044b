//! cutover-targets — the target group model.
//!
//! A target group is one color (blue or green) of one service: a pool of
//! instances launched from a single image, each with its own health status.
//! Groups are created through the compute platform and watched by the
//! health prober via a membership channel that fires whenever the instance
//! set changes.

pub mod error;
pub mod model;

pub use error::{TargetError, TargetResult};
pub use model::{TargetGroup, TargetGroupModel};
