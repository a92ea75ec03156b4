//! Status resolution. The task store is the only source of truth for task state; the artifact
//! store is consulted solely to confirm that a `completed` product is still retrievable.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::application::artifacts::{ArtifactStore, StorageError, artifact_key, log_key};
use crate::application::repos::{RepoError, TaskStore};
use crate::domain::entities::CompilationTask;
use crate::domain::task::TaskKey;
use crate::domain::types::{FailureReason, TaskStatus};

const ARTIFACT_MISSING_DESCRIPTION: &str =
    "task completed but its artifact is no longer retrievable";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no task exists for `{task_id}`")]
    NotFound { task_id: String },
    #[error("task `{task_id}` is {status}, not completed")]
    NotReady { task_id: String, status: TaskStatus },
    #[error("no log stored for `{task_id}`")]
    LogMissing { task_id: String },
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone)]
pub struct StatusResolver {
    store: Arc<dyn TaskStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl StatusResolver {
    pub fn new(store: Arc<dyn TaskStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }

    /// Current view of the task. A `completed` record whose artifact has vanished is reported
    /// as `errored` with [`FailureReason::ArtifactMissing`].
    pub async fn resolve(&self, key: &TaskKey) -> Result<CompilationTask, ResolveError> {
        let mut task = self
            .store
            .find(key)
            .await?
            .ok_or_else(|| ResolveError::NotFound {
                task_id: key.task_id(),
            })?;

        if task.status == TaskStatus::Completed && !self.artifacts.exists(&artifact_key(key)).await?
        {
            warn!(
                target = "texcompiler::status",
                op = "status::resolve",
                task_id = %key,
                "Completed task has no stored artifact"
            );
            task.status = TaskStatus::Errored;
            task.reason = Some(FailureReason::ArtifactMissing);
            task.description = Some(ARTIFACT_MISSING_DESCRIPTION.to_string());
            task.size_bytes = None;
        }

        Ok(task)
    }

    /// The compiled product, available only once the task is `completed`.
    pub async fn artifact(&self, key: &TaskKey) -> Result<(CompilationTask, Bytes), ResolveError> {
        let task = self.resolve(key).await?;
        if task.status != TaskStatus::Completed {
            return Err(ResolveError::NotReady {
                task_id: key.task_id(),
                status: task.status,
            });
        }

        match self.artifacts.get(&artifact_key(key)).await {
            Ok(bytes) => Ok((task, bytes)),
            Err(StorageError::NotFound { .. }) => Err(ResolveError::NotReady {
                task_id: key.task_id(),
                status: TaskStatus::Errored,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// The log of the task's current attempt. Until that attempt finishes the stored log, if
    /// any, belongs to an earlier one and is not served.
    pub async fn log(&self, key: &TaskKey) -> Result<(CompilationTask, Bytes), ResolveError> {
        let task = self.resolve(key).await?;
        if !task.is_terminal() {
            return Err(ResolveError::LogMissing {
                task_id: key.task_id(),
            });
        }
        match self.artifacts.get(&log_key(key)).await {
            Ok(bytes) => Ok((task, bytes)),
            Err(StorageError::NotFound { .. }) => Err(ResolveError::LogMissing {
                task_id: key.task_id(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn health_check(&self) -> Result<(), RepoError> {
        self.store.health_check().await
    }
}
