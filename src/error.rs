use thiserror::Error;

use crate::state_machine::{ApplicationId, Role, State};
use crate::validator::RuleViolation;

/// Errors surfaced by lifecycle operations. None of them leave a partial
/// write behind: a failed transition never changes the stored aggregate.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("guard failed: {0}")]
    GuardFailed(RuleViolation),

    #[error("invalid transition: {action} is not defined for {state}")]
    InvalidTransition { state: State, action: &'static str },

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("{role} is not permitted to perform {action}")]
    Forbidden { role: Role, action: &'static str },

    #[error("application not found: {0}")]
    NotFound(ApplicationId),

    #[error("collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl WorkflowError {
    /// True when the caller should reload the aggregate and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::VersionConflict { .. })
    }
}

impl From<RepositoryError> for WorkflowError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => WorkflowError::NotFound(id),
            RepositoryError::VersionConflict { expected, actual } => {
                WorkflowError::VersionConflict { expected, actual }
            }
            other => WorkflowError::Persistence(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("application not found: {0}")]
    NotFound(ApplicationId),

    #[error("application already exists: {0}")]
    AlreadyExists(ApplicationId),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("outbox entry not found: {0}")]
    OutboxEntryNotFound(uuid::Uuid),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures reported by external collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CollaboratorError::Timeout { .. } | CollaboratorError::Unavailable(_) => {
                FailureKind::System
            }
            CollaboratorError::Rejected(_) => FailureKind::Business,
        }
    }
}

/// Classifies an outbox failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The request itself is unacceptable; retrying cannot help.
    Business,
    /// Infrastructure failure (timeout, outage, contention); eligible for retry.
    System,
}
