//! Domain entities mirrored from persistent storage.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::{
    task::TaskKey,
    types::{FailureReason, TaskStatus},
};

/// The mutable record of a compilation under one [`TaskKey`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompilationTask {
    pub key: TaskKey,
    pub status: TaskStatus,
    pub owner: Option<String>,
    pub reason: Option<FailureReason>,
    pub description: Option<String>,
    pub size_bytes: Option<i64>,
    pub stamp_label: Option<String>,
    pub stamp_link: Option<String>,
    pub attempt_count: i32,
    pub retry_count: i32,
    pub lease_owner: Option<String>,
    pub claim_id: Option<Uuid>,
    pub lease_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl CompilationTask {
    /// A freshly admitted record.
    pub fn queued(key: TaskKey, options: &TaskOptions, now: OffsetDateTime) -> Self {
        Self {
            key,
            status: TaskStatus::Queued,
            owner: options.owner.clone(),
            reason: None,
            description: None,
            size_bytes: None,
            stamp_label: options.stamp_label.clone(),
            stamp_link: options.stamp_link.clone(),
            attempt_count: 1,
            retry_count: 0,
            lease_owner: None,
            claim_id: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Submission-supplied attributes that travel with a task but are not part of its identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskOptions {
    pub owner: Option<String>,
    pub stamp_label: Option<String>,
    pub stamp_link: Option<String>,
}
