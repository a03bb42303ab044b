//! Error types for configuration loading and deployment transitions.

use thiserror::Error;

use crate::types::DeploymentState;

/// Errors raised while loading or validating `cutover.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: String, value: String },

    #[error("invalid service {service}: {reason}")]
    Service { service: String, reason: String },
}

/// A deployment was asked to move along an edge its state machine lacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid deployment transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: DeploymentState,
    pub to: DeploymentState,
}
