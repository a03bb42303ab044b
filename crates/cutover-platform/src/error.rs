//! Errors reported by external collaborators.

use thiserror::Error;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("no repository registered for service {0}")]
    UnknownRepository(String),

    #[error("tag {tag} not found for service {service}")]
    TagNotFound { service: String, tag: String },

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("terminate failed: {0}")]
    Terminate(String),

    #[error("load balancer rejected weights: {0}")]
    LoadBalancer(String),
}
