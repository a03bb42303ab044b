//! Router error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid shift plan: {0}")]
    InvalidPlan(String),

    #[error("routing failed at step {step}: {reason}")]
    RoutingFailure { step: usize, reason: String },

    #[error("revert failed for {service}: {reason}")]
    Revert { service: String, reason: String },
}

pub type RouterResult<T> = Result<T, RouterError>;
