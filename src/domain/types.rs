//! Shared domain enumerations aligned with persisted database enums.

use serde::{Deserialize, Serialize};

pub use texcompiler_api_types::{FailureReason, OutputFormat, TaskStatus, UnknownFormat};

/// Classification of a single sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    CompileFailure,
    InfraError,
    Timeout,
}

impl ExecutionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::CompileFailure => "compile_failure",
            ExecutionOutcome::InfraError => "infra_error",
            ExecutionOutcome::Timeout => "timeout",
        }
    }

    /// Infrastructure trouble and timeouts may succeed on another attempt; bad source will not.
    pub fn is_retryable(self) -> bool {
        matches!(self, ExecutionOutcome::InfraError | ExecutionOutcome::Timeout)
    }
}

/// Queue namespaces used by the dispatch backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Compile,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Compile => "texcompiler::compile",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infra_outcomes_are_retryable() {
        assert!(ExecutionOutcome::InfraError.is_retryable());
        assert!(ExecutionOutcome::Timeout.is_retryable());
        assert!(!ExecutionOutcome::CompileFailure.is_retryable());
        assert!(!ExecutionOutcome::Success.is_retryable());
    }
}
