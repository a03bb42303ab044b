//! Orchestrator error types.

use thiserror::Error;

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("service {service} already has deployment {deployment} in progress")]
    Conflict { service: String, deployment: String },

    #[error("deployment {0} has already finished")]
    AlreadyFinished(String),

    #[error("deployment {0} is finalizing and can no longer be cancelled")]
    Finalizing(String),

    #[error("invalid service {service}: {reason}")]
    InvalidService { service: String, reason: String },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("state store error: {0}")]
    State(#[from] cutover_state::StateError),
}

impl OrchestratorError {
    /// The request collides with a deployment's lifecycle.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Conflict { .. }
                | OrchestratorError::AlreadyFinished(_)
                | OrchestratorError::Finalizing(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ServiceNotFound(_) | OrchestratorError::DeploymentNotFound(_)
        )
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
