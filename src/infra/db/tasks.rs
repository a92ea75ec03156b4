//! `TaskStore` on Postgres. Dispatch messages are apalis jobs in the same database, pushed in
//! the same transaction as the record change that requires them.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{FromRow, Postgres, Transaction};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::application::jobs::CompileJobPayload;
use crate::application::repos::{
    AdmitRequest, Admission, Claim, ClaimedTask, ExpiredLease, RepoError, TaskStore,
    TaskTransition,
};
use crate::domain::entities::CompilationTask;
use crate::domain::task::TaskKey;
use crate::domain::types::{FailureReason, JobType, OutputFormat, TaskStatus};

use super::{PostgresRepositories, map_sqlx_error};

const TASK_COLUMNS: &str = "source_id, checksum, output_format, status, owner, reason, \
    description, size_bytes, stamp_label, stamp_link, attempt_count, retry_count, lease_owner, \
    claim_id, lease_expires_at, created_at, started_at, completed_at, updated_at";

/// apalis attempts per dispatch message. Only store errors fail a job; execution retries are
/// tracked on the task itself.
const JOB_MAX_ATTEMPTS: i32 = 3;
const JOB_PRIORITY: i32 = 0;

#[derive(Debug, FromRow)]
struct TaskRow {
    source_id: String,
    checksum: String,
    output_format: OutputFormat,
    status: TaskStatus,
    owner: Option<String>,
    reason: Option<FailureReason>,
    description: Option<String>,
    size_bytes: Option<i64>,
    stamp_label: Option<String>,
    stamp_link: Option<String>,
    attempt_count: i32,
    retry_count: i32,
    lease_owner: Option<String>,
    claim_id: Option<Uuid>,
    lease_expires_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    started_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<TaskRow> for CompilationTask {
    type Error = RepoError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let key = TaskKey::new(row.source_id, row.checksum, row.output_format).map_err(|err| {
            RepoError::Integrity {
                message: format!("stored task key is invalid: {err}"),
            }
        })?;

        Ok(CompilationTask {
            key,
            status: row.status,
            owner: row.owner,
            reason: row.reason,
            description: row.description,
            size_bytes: row.size_bytes,
            stamp_label: row.stamp_label,
            stamp_link: row.stamp_link,
            attempt_count: row.attempt_count,
            retry_count: row.retry_count,
            lease_owner: row.lease_owner,
            claim_id: row.claim_id,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExpiredRow {
    source_id: String,
    checksum: String,
    output_format: OutputFormat,
    lease_owner: Option<String>,
    claim_id: Uuid,
    retry_count: i32,
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

impl PostgresRepositories {
    async fn push_compile_job(
        tx: &mut Transaction<'_, Postgres>,
        key: &TaskKey,
        run_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        let payload = serde_json::to_value(CompileJobPayload::from(key))
            .map_err(|err| RepoError::from_persistence(err.to_string()))?;

        sqlx::query("SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id")
            .bind(JobType::Compile.as_str())
            .bind(payload)
            .bind("Pending")
            .bind(run_at)
            .bind(JOB_MAX_ATTEMPTS)
            .bind(JOB_PRIORITY)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn apply_transition(
        &self,
        claim: &Claim,
        transition: TaskTransition,
        expired_before: Option<OffsetDateTime>,
    ) -> Result<bool, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let (status, reason, description, size_bytes, requeue_at) = match transition {
            TaskTransition::Completed { size_bytes } => {
                (TaskStatus::Completed, None, None, Some(size_bytes), None)
            }
            TaskTransition::Failed {
                reason,
                description,
            } => (TaskStatus::Failed, Some(reason), Some(description), None, None),
            TaskTransition::Errored {
                reason,
                description,
            } => (TaskStatus::Errored, Some(reason), Some(description), None, None),
            TaskTransition::Retry {
                run_at,
                reason,
                description,
            } => {
                debug!(
                    target = "texcompiler::db",
                    op = "tasks::finish",
                    task_id = %claim.key,
                    reason = reason.as_str(),
                    description = %description,
                    "Requeueing task"
                );
                (TaskStatus::Queued, None, None, None, Some(run_at))
            }
        };
        let retry = requeue_at.is_some();

        let result = sqlx::query(
            r#"
            UPDATE compilation_tasks
               SET status = $5,
                   reason = $6,
                   description = $7,
                   size_bytes = $8,
                   attempt_count = attempt_count + CASE WHEN $9 THEN 1 ELSE 0 END,
                   retry_count = retry_count + CASE WHEN $9 THEN 1 ELSE 0 END,
                   completed_at = CASE WHEN $9 THEN NULL ELSE now() END,
                   started_at = CASE WHEN $9 THEN NULL ELSE started_at END,
                   lease_owner = NULL,
                   claim_id = NULL,
                   lease_expires_at = NULL,
                   updated_at = now()
             WHERE source_id = $1
               AND checksum = $2
               AND output_format = $3
               AND claim_id = $4
               AND status = 'in_progress'
               AND ($10::timestamptz IS NULL OR lease_expires_at < $10)
            "#,
        )
        .bind(claim.key.source_id())
        .bind(claim.key.checksum())
        .bind(claim.key.output_format())
        .bind(claim.claim_id)
        .bind(status)
        .bind(reason)
        .bind(description)
        .bind(size_bytes)
        .bind(retry)
        .bind(expired_before)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(false);
        }

        if let Some(run_at) = requeue_at {
            Self::push_compile_job(&mut tx, &claim.key, run_at).await?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(true)
    }
}

#[async_trait]
impl TaskStore for PostgresRepositories {
    async fn admit(&self, request: AdmitRequest) -> Result<Admission, RepoError> {
        let AdmitRequest {
            key,
            options,
            force,
        } = request;
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let sql = format!(
            r#"
            INSERT INTO compilation_tasks
                (source_id, checksum, output_format, owner, stamp_label, stamp_link)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_id, checksum, output_format) DO UPDATE
               SET status = 'queued',
                   owner = EXCLUDED.owner,
                   stamp_label = EXCLUDED.stamp_label,
                   stamp_link = EXCLUDED.stamp_link,
                   reason = NULL,
                   description = NULL,
                   size_bytes = NULL,
                   attempt_count = compilation_tasks.attempt_count + 1,
                   retry_count = 0,
                   lease_owner = NULL,
                   claim_id = NULL,
                   lease_expires_at = NULL,
                   started_at = NULL,
                   completed_at = NULL,
                   updated_at = now()
             WHERE $7
               AND compilation_tasks.status IN ('completed', 'failed', 'errored')
            RETURNING {TASK_COLUMNS}
            "#
        );

        let admitted = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(key.source_id())
            .bind(key.checksum())
            .bind(key.output_format())
            .bind(options.owner.as_deref())
            .bind(options.stamp_label.as_deref())
            .bind(options.stamp_link.as_deref())
            .bind(force)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if let Some(row) = admitted {
            Self::push_compile_job(&mut tx, &key, OffsetDateTime::now_utc()).await?;
            tx.commit().await.map_err(map_sqlx_error)?;
            return Ok(Admission {
                task: row.try_into()?,
                accepted: true,
            });
        }

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM compilation_tasks \
             WHERE source_id = $1 AND checksum = $2 AND output_format = $3"
        );
        let existing = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(key.source_id())
            .bind(key.checksum())
            .bind(key.output_format())
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(Admission {
            task: existing.try_into()?,
            accepted: false,
        })
    }

    async fn find(&self, key: &TaskKey) -> Result<Option<CompilationTask>, RepoError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM compilation_tasks \
             WHERE source_id = $1 AND checksum = $2 AND output_format = $3"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(key.source_id())
            .bind(key.checksum())
            .bind(key.output_format())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(CompilationTask::try_from).transpose()
    }

    async fn claim(
        &self,
        key: &TaskKey,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, RepoError> {
        let claim_id = Uuid::new_v4();
        let sql = format!(
            r#"
            UPDATE compilation_tasks
               SET status = 'in_progress',
                   started_at = now(),
                   lease_owner = $4,
                   claim_id = $5,
                   lease_expires_at = now() + $6 * interval '1 millisecond',
                   updated_at = now()
             WHERE source_id = $1
               AND checksum = $2
               AND output_format = $3
               AND (status = 'queued'
                    OR (status = 'in_progress' AND lease_expires_at < now()))
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(key.source_id())
            .bind(key.checksum())
            .bind(key.output_format())
            .bind(worker_id)
            .bind(claim_id)
            .bind(lease_millis(lease) as f64)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ClaimedTask {
            claim: Claim {
                key: key.clone(),
                worker_id: worker_id.to_string(),
                claim_id,
            },
            task: row.try_into()?,
        }))
    }

    async fn renew_lease(&self, claim: &Claim, lease: Duration) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE compilation_tasks
               SET lease_expires_at = now() + $5 * interval '1 millisecond',
                   updated_at = now()
             WHERE source_id = $1
               AND checksum = $2
               AND output_format = $3
               AND claim_id = $4
               AND status = 'in_progress'
            "#,
        )
        .bind(claim.key.source_id())
        .bind(claim.key.checksum())
        .bind(claim.key.output_format())
        .bind(claim.claim_id)
        .bind(lease_millis(lease) as f64)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish(&self, claim: &Claim, transition: TaskTransition) -> Result<bool, RepoError> {
        self.apply_transition(claim, transition, None).await
    }

    async fn expired_leases(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ExpiredLease>, RepoError> {
        let rows = sqlx::query_as::<_, ExpiredRow>(
            r#"
            SELECT source_id, checksum, output_format, lease_owner, claim_id, retry_count
              FROM compilation_tasks
             WHERE status = 'in_progress'
               AND lease_expires_at < $1
               AND claim_id IS NOT NULL
             ORDER BY lease_expires_at
             LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                let key = TaskKey::new(row.source_id, row.checksum, row.output_format).map_err(
                    |err| RepoError::Integrity {
                        message: format!("stored task key is invalid: {err}"),
                    },
                )?;
                Ok(ExpiredLease {
                    claim: Claim {
                        key,
                        worker_id: row.lease_owner.unwrap_or_default(),
                        claim_id: row.claim_id,
                    },
                    retry_count: row.retry_count,
                })
            })
            .collect()
    }

    async fn reap(
        &self,
        claim: &Claim,
        transition: TaskTransition,
        now: OffsetDateTime,
    ) -> Result<bool, RepoError> {
        self.apply_transition(claim, transition, Some(now)).await
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        PostgresRepositories::health_check(self)
            .await
            .map_err(map_sqlx_error)
    }
}
