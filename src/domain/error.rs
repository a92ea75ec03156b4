use thiserror::Error;

use super::types::UnknownFormat;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain validation failed: {message}")]
    Validation { message: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Failure taxonomy of the compilation lifecycle as seen by callers.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    InvalidFormat(#[from] UnknownFormat),
    #[error("no task exists for `{task_id}`")]
    NotFound { task_id: String },
    #[error("task `{task_id}` is already queued or running")]
    AlreadyInFlight { task_id: String },
    #[error("source checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("compilation failed: {0}")]
    CompileFailure(String),
    #[error("infrastructure error: {0}")]
    InfraError(String),
    #[error("execution exceeded time limit")]
    Timeout,
}
