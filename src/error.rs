use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildFarmError {
    #[error("No servant provides compiler environment {0}")]
    EnvironmentNotFound(String),

    #[error("No compile capacity available")]
    ResourceExhausted,

    #[error("Timed out waiting for capacity")]
    Timeout,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Task not found: {0}")]
    TaskNotFound(u64),

    #[error("Lease not found: {0}")]
    LeaseNotFound(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BuildFarmError {
    /// Transient failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BuildFarmError::ResourceExhausted | BuildFarmError::Timeout | BuildFarmError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BuildFarmError>;
