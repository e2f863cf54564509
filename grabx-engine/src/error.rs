//! Error types for the grab engine

use grabx_core::{InvalidTransition, JobId, JobState};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Misuse of the job registry
///
/// These are programming errors on the caller's side. They are always
/// returned to the caller and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("job {0} already exists")]
    DuplicateId(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job {0} is running")]
    InUse(JobId),
}

impl From<InvalidTransition> for RegistryError {
    fn from(err: InvalidTransition) -> Self {
        RegistryError::InvalidTransition {
            id: err.id,
            from: err.from,
            to: err.to,
        }
    }
}

/// Errors returned by the orchestrator facade
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The pending queue is bounded and full, and the policy is to reject
    #[error("pending queue is full ({bound} jobs)")]
    QueueFull { bound: usize },

    /// Shutdown has begun; no new jobs are accepted
    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::NotFound(_)))
    }

    /// Check if this error is a rejected state transition
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::InvalidTransition { .. }))
    }
}
