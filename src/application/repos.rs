//! Repository traits describing persistence adapters.
//!
//! The task store is the single backend of record: it owns both the task records and the
//! dispatch queue, so admission and re-enqueue happen atomically with the record change.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::{CompilationTask, TaskOptions};
use crate::domain::task::TaskKey;
use crate::domain::types::FailureReason;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AdmitRequest {
    pub key: TaskKey,
    pub options: TaskOptions,
    pub force: bool,
}

/// Result of the atomic create-or-check performed at submission time.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The record after the operation (new, reset, or untouched).
    pub task: CompilationTask,
    /// Whether a dispatch message was enqueued.
    pub accepted: bool,
}

/// Proof of ownership of an in-flight attempt. Every write made by a worker is
/// conditioned on the claim still being current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: TaskKey,
    pub worker_id: String,
    pub claim_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub claim: Claim,
    pub task: CompilationTask,
}

/// Terminal or retry transition applied by the worker holding the claim.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    Completed {
        size_bytes: i64,
    },
    Failed {
        reason: FailureReason,
        description: String,
    },
    Errored {
        reason: FailureReason,
        description: String,
    },
    /// Back to `queued` with a new dispatch message delivered no earlier than `run_at`.
    Retry {
        run_at: OffsetDateTime,
        reason: FailureReason,
        description: String,
    },
}

impl TaskTransition {
    pub fn label(&self) -> &'static str {
        match self {
            TaskTransition::Completed { .. } => "completed",
            TaskTransition::Failed { .. } => "failed",
            TaskTransition::Errored { .. } => "errored",
            TaskTransition::Retry { .. } => "retry",
        }
    }
}

/// An `in_progress` task whose lease ran out without renewal.
#[derive(Debug, Clone)]
pub struct ExpiredLease {
    pub claim: Claim,
    pub retry_count: i32,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically create a queued record (or reset a terminal one when forced) and enqueue
    /// its dispatch message. Leaves in-flight and unforced terminal records untouched.
    async fn admit(&self, request: AdmitRequest) -> Result<Admission, RepoError>;

    async fn find(&self, key: &TaskKey) -> Result<Option<CompilationTask>, RepoError>;

    /// Move `queued` (or lease-expired `in_progress`) to `in_progress` under a fresh claim.
    /// Returns `None` when the task is missing, terminal, or held under a live lease.
    async fn claim(
        &self,
        key: &TaskKey,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, RepoError>;

    /// Extend the lease. `false` means the claim is no longer current.
    async fn renew_lease(&self, claim: &Claim, lease: Duration) -> Result<bool, RepoError>;

    /// Apply a transition. `false` means the claim is no longer current and nothing changed.
    async fn finish(&self, claim: &Claim, transition: TaskTransition) -> Result<bool, RepoError>;

    /// In-progress tasks whose lease expired before `now`.
    async fn expired_leases(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ExpiredLease>, RepoError>;

    /// Like [`TaskStore::finish`], but only while the claim's lease is still expired at `now`,
    /// so a worker that renewed in the meantime keeps its attempt.
    async fn reap(
        &self,
        claim: &Claim,
        transition: TaskTransition,
        now: OffsetDateTime,
    ) -> Result<bool, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError>;
}
