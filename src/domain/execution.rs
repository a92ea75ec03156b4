//! Result of one sandbox run. Never persisted as-is; the worker folds it into the task record.

use bytes::Bytes;

use super::error::CompileError;
use super::types::{ExecutionOutcome, FailureReason};

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub exit_code: Option<i32>,
    pub log_bytes: Bytes,
    pub artifact_bytes: Option<Bytes>,
    pub reason: Option<FailureReason>,
    pub detail: Option<String>,
}

pub const TIME_LIMIT_DETAIL: &str = "execution exceeded time limit";

impl ExecutionResult {
    pub fn success(exit_code: i32, log_bytes: Bytes, artifact: Bytes) -> Self {
        Self {
            outcome: ExecutionOutcome::Success,
            exit_code: Some(exit_code),
            log_bytes,
            artifact_bytes: Some(artifact),
            reason: None,
            detail: None,
        }
    }

    pub fn compile_failure(
        exit_code: Option<i32>,
        log_bytes: Bytes,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            outcome: ExecutionOutcome::CompileFailure,
            exit_code,
            log_bytes,
            artifact_bytes: None,
            reason: Some(FailureReason::CompilationErrors),
            detail: Some(detail.into()),
        }
    }

    pub fn infra_error(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::InfraError,
            exit_code: None,
            log_bytes: Bytes::new(),
            artifact_bytes: None,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }

    pub fn timeout(log_bytes: Bytes) -> Self {
        Self {
            outcome: ExecutionOutcome::Timeout,
            exit_code: None,
            log_bytes,
            artifact_bytes: None,
            reason: Some(FailureReason::TimeLimitExceeded),
            detail: Some(TIME_LIMIT_DETAIL.to_string()),
        }
    }

    pub fn with_log(mut self, log_bytes: Bytes) -> Self {
        self.log_bytes = log_bytes;
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Reason recorded on the task when this result is not a success.
    pub fn failure_reason(&self) -> FailureReason {
        self.reason.unwrap_or(match self.outcome {
            ExecutionOutcome::Timeout => FailureReason::TimeLimitExceeded,
            ExecutionOutcome::CompileFailure => FailureReason::CompilationErrors,
            _ => FailureReason::SandboxUnavailable,
        })
    }

    pub fn failure_detail(&self) -> String {
        self.detail
            .clone()
            .unwrap_or_else(|| self.failure_reason().as_str().replace('_', " "))
    }

    /// The caller-facing error this result represents, if any.
    pub fn error(&self) -> Option<CompileError> {
        match self.outcome {
            ExecutionOutcome::Success => None,
            ExecutionOutcome::CompileFailure => {
                Some(CompileError::CompileFailure(self.failure_detail()))
            }
            ExecutionOutcome::InfraError => Some(CompileError::InfraError(self.failure_detail())),
            ExecutionOutcome::Timeout => Some(CompileError::Timeout),
        }
    }
}
