use serde::{Deserialize, Serialize};
use texcompiler_api_types::{SubmitRequest, TaskStatusResponse};

use crate::application::submission::SubmitCommand;
use crate::domain::entities::CompilationTask;

/// Path segments of `/{source_id}/{checksum}/{format}`, already percent-decoded by axum.
#[derive(Debug, Deserialize)]
pub struct TaskPath {
    pub source_id: String,
    pub checksum: String,
    pub format: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

impl From<SubmitRequest> for SubmitCommand {
    fn from(request: SubmitRequest) -> Self {
        SubmitCommand {
            source_id: request.source_id,
            checksum: request.checksum,
            output_format: request.output_format,
            force: request.force,
            owner: request.owner,
            stamp_label: request.stamp_label,
            stamp_link: request.stamp_link,
        }
    }
}

impl From<&CompilationTask> for TaskStatusResponse {
    fn from(task: &CompilationTask) -> Self {
        let key = &task.key;
        TaskStatusResponse {
            source_id: key.source_id().to_string(),
            checksum: key.checksum().to_string(),
            output_format: key.output_format(),
            status: task.status,
            owner: task.owner.clone(),
            reason: task.reason,
            description: task.description.clone(),
            size_bytes: task.size_bytes,
            task_id: key.task_id(),
            attempt_count: task.attempt_count,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}
