//! Target group error types.

use thiserror::Error;

use cutover_core::GroupId;
use cutover_platform::PlatformError;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("requested {requested} instances, ceiling is {ceiling}")]
    Capacity { requested: u32, ceiling: u32 },

    #[error("target group already exists: {0}")]
    AlreadyExists(GroupId),

    #[error("target group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("launch failed: {0}")]
    Launch(#[source] PlatformError),

    #[error("failed to terminate {group}: {source}")]
    Termination {
        group: GroupId,
        #[source]
        source: PlatformError,
    },
}

pub type TargetResult<T> = Result<T, TargetError>;
