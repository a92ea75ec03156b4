//! Submission gate: derives the task key and decides whether a new execution is needed.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::application::repos::{AdmitRequest, RepoError, TaskStore};
use crate::domain::entities::{CompilationTask, TaskOptions};
use crate::domain::error::{CompileError, DomainError};
use crate::domain::task::TaskKey;
use crate::domain::types::OutputFormat;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone, Default)]
pub struct SubmitCommand {
    pub source_id: String,
    pub checksum: String,
    pub output_format: String,
    pub force: bool,
    pub owner: Option<String>,
    pub stamp_label: Option<String>,
    pub stamp_link: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub task: CompilationTask,
    pub accepted: bool,
}

impl Submission {
    /// Why a submission was not accepted, if it wasn't. Terminal tasks are not an error:
    /// the caller is pointed at the existing result instead.
    pub fn conflict(&self) -> Option<CompileError> {
        if self.accepted || self.task.is_terminal() {
            return None;
        }
        Some(CompileError::AlreadyInFlight {
            task_id: self.task.key.task_id(),
        })
    }
}

#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn TaskStore>,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn submit(&self, command: SubmitCommand) -> Result<Submission, SubmitError> {
        let format = command
            .output_format
            .trim()
            .parse::<OutputFormat>()
            .map_err(CompileError::from)?;
        let key = TaskKey::new(command.source_id, command.checksum, format)?;
        let options = TaskOptions {
            owner: non_blank(command.owner),
            stamp_label: non_blank(command.stamp_label),
            stamp_link: non_blank(command.stamp_link),
        };

        let admission = self
            .store
            .admit(AdmitRequest {
                key,
                options,
                force: command.force,
            })
            .await?;

        let result = if admission.accepted {
            "accepted"
        } else if admission.task.is_terminal() {
            "terminal"
        } else {
            "in_flight"
        };
        metrics::counter!("texcompiler_submissions_total", "result" => result).increment(1);
        info!(
            target = "texcompiler::submission",
            op = "submission::submit",
            task_id = %admission.task.key,
            force = command.force,
            result,
            status = %admission.task.status,
            attempt_count = admission.task.attempt_count,
            "Submission processed"
        );

        Ok(Submission {
            task: admission.task,
            accepted: admission.accepted,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
