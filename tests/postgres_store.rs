use std::time::Duration;

use sqlx::PgPool;
use time::OffsetDateTime;

use texcompiler::application::repos::{AdmitRequest, TaskStore, TaskTransition};
use texcompiler::domain::entities::TaskOptions;
use texcompiler::domain::task::TaskKey;
use texcompiler::domain::types::{FailureReason, JobType, OutputFormat, TaskStatus};
use texcompiler::infra::db::PostgresRepositories;

const CHECKSUM: &str = "\"Mon, 01 Jan 2019 00:00:00 GMT\"";

async fn repositories(pool: PgPool) -> PostgresRepositories {
    PostgresRepositories::run_migrations(&pool)
        .await
        .expect("migrations apply");
    PostgresRepositories::new(pool)
}

fn key() -> TaskKey {
    TaskKey::new("1902.00123", CHECKSUM, OutputFormat::Pdf).expect("key")
}

fn admit(force: bool) -> AdmitRequest {
    AdmitRequest {
        key: key(),
        options: TaskOptions {
            owner: Some("1234".to_string()),
            ..Default::default()
        },
        force,
    }
}

async fn queued_jobs(repos: &PostgresRepositories) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM apalis.jobs WHERE job_type = $1")
        .bind(JobType::Compile.as_str())
        .fetch_one(repos.pool())
        .await
        .expect("count jobs")
}

#[sqlx::test(migrations = false)]
async fn migrations_are_idempotent(pool: PgPool) {
    PostgresRepositories::run_migrations(&pool)
        .await
        .expect("first run");
    PostgresRepositories::run_migrations(&pool)
        .await
        .expect("second run");
}

#[sqlx::test(migrations = false)]
async fn admission_enqueues_exactly_once(pool: PgPool) {
    let repos = repositories(pool).await;

    let first = repos.admit(admit(false)).await.expect("first admit");
    let second = repos.admit(admit(true)).await.expect("second admit");

    assert!(first.accepted);
    assert_eq!(first.task.status, TaskStatus::Queued);
    assert_eq!(first.task.owner.as_deref(), Some("1234"));
    assert!(!second.accepted, "force never resets an in-flight task");
    assert_eq!(second.task.attempt_count, 1);
    assert_eq!(queued_jobs(&repos).await, 1);
}

#[sqlx::test(migrations = false)]
async fn claim_is_exclusive_and_finish_requires_the_claim(pool: PgPool) {
    let repos = repositories(pool).await;
    repos.admit(admit(false)).await.expect("admit");

    let claimed = repos
        .claim(&key(), "worker-a", Duration::from_secs(30))
        .await
        .expect("claim")
        .expect("claimable");
    assert_eq!(claimed.task.status, TaskStatus::InProgress);
    assert!(claimed.task.started_at.is_some());

    assert!(
        repos
            .claim(&key(), "worker-b", Duration::from_secs(30))
            .await
            .expect("second claim")
            .is_none()
    );
    assert!(
        repos
            .renew_lease(&claimed.claim, Duration::from_secs(30))
            .await
            .expect("renew")
    );

    let applied = repos
        .finish(
            &claimed.claim,
            TaskTransition::Completed { size_bytes: 17 },
        )
        .await
        .expect("finish");
    assert!(applied);
    assert!(
        !repos
            .finish(
                &claimed.claim,
                TaskTransition::Failed {
                    reason: FailureReason::CompilationErrors,
                    description: "late".to_string(),
                },
            )
            .await
            .expect("stale finish"),
        "a consumed claim cannot write again"
    );

    let task = repos.find(&key()).await.expect("find").expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.size_bytes, Some(17));
    assert!(task.claim_id.is_none());
    assert!(task.completed_at.is_some());
}

#[sqlx::test(migrations = false)]
async fn retry_requeues_with_a_new_job(pool: PgPool) {
    let repos = repositories(pool).await;
    repos.admit(admit(false)).await.expect("admit");
    let claimed = repos
        .claim(&key(), "worker-a", Duration::from_secs(30))
        .await
        .expect("claim")
        .expect("claimable");

    let applied = repos
        .finish(
            &claimed.claim,
            TaskTransition::Retry {
                run_at: OffsetDateTime::now_utc() + Duration::from_secs(5),
                reason: FailureReason::SandboxUnavailable,
                description: "docker daemon unreachable".to_string(),
            },
        )
        .await
        .expect("retry");
    assert!(applied);

    let task = repos.find(&key()).await.expect("find").expect("task");
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempt_count, 2);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.reason, None);
    assert_eq!(task.description, None);
    assert_eq!(queued_jobs(&repos).await, 2);
}

#[sqlx::test(migrations = false)]
async fn expired_leases_are_reaped_once(pool: PgPool) {
    let repos = repositories(pool).await;
    repos.admit(admit(false)).await.expect("admit");
    let claimed = repos
        .claim(&key(), "worker-a", Duration::from_millis(1))
        .await
        .expect("claim")
        .expect("claimable");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let now = OffsetDateTime::now_utc();
    let expired = repos.expired_leases(now, 10).await.expect("expired");
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].claim, claimed.claim);

    let transition = TaskTransition::Errored {
        reason: FailureReason::WorkerLost,
        description: "worker stopped renewing its lease".to_string(),
    };
    assert!(
        repos
            .reap(&claimed.claim, transition.clone(), now)
            .await
            .expect("reap")
    );
    assert!(
        !repos
            .reap(&claimed.claim, transition, now)
            .await
            .expect("second reap")
    );

    let task = repos.find(&key()).await.expect("find").expect("task");
    assert_eq!(task.status, TaskStatus::Errored);
    assert_eq!(task.reason, Some(FailureReason::WorkerLost));
}

#[sqlx::test(migrations = false)]
async fn forced_resubmission_resets_terminal_task(pool: PgPool) {
    let repos = repositories(pool).await;
    repos.admit(admit(false)).await.expect("admit");
    let claimed = repos
        .claim(&key(), "worker-a", Duration::from_secs(30))
        .await
        .expect("claim")
        .expect("claimable");
    repos
        .finish(
            &claimed.claim,
            TaskTransition::Failed {
                reason: FailureReason::CompilationErrors,
                description: "converter exited with status 1".to_string(),
            },
        )
        .await
        .expect("finish");

    let unforced = repos.admit(admit(false)).await.expect("unforced");
    assert!(!unforced.accepted);
    assert_eq!(unforced.task.status, TaskStatus::Failed);

    let forced = repos.admit(admit(true)).await.expect("forced");
    assert!(forced.accepted);
    assert_eq!(forced.task.status, TaskStatus::Queued);
    assert_eq!(forced.task.attempt_count, 2);
    assert_eq!(forced.task.retry_count, 0);
    assert_eq!(forced.task.reason, None);
    assert_eq!(forced.task.created_at, unforced.task.created_at);
    assert_eq!(queued_jobs(&repos).await, 2);
}

#[sqlx::test(migrations = false)]
async fn health_check_round_trips(pool: PgPool) {
    let repos = repositories(pool).await;
    TaskStore::health_check(&repos)
        .await
        .expect("healthy");
}
