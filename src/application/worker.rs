//! One compilation attempt, start to finish.
//!
//! The worker claims the task, runs the sandbox while renewing its lease, persists the log
//! (and the artifact on success), then applies the resulting transition under its claim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::application::artifacts::{ArtifactStore, artifact_key, log_key};
use crate::application::repos::{Claim, ExpiredLease, RepoError, TaskStore, TaskTransition};
use crate::application::sandbox::{RunRequest, Sandbox, SourceFetcher, execute};
use crate::domain::execution::ExecutionResult;
use crate::domain::task::TaskKey;
use crate::domain::types::{ExecutionOutcome, FailureReason};

const WORKER_LOST_DESCRIPTION: &str = "worker stopped renewing its lease";
const REAP_BATCH: i64 = 100;

/// Bounded exponential backoff for infrastructure failures and timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn allows(&self, retry_count: i32) -> bool {
        retry_count >= 0 && (retry_count as u32) < self.max_retries
    }

    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 16) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Retry while budget remains, otherwise settle on `errored`.
    pub fn transition(
        &self,
        retry_count: i32,
        reason: FailureReason,
        description: String,
        now: OffsetDateTime,
    ) -> TaskTransition {
        if self.allows(retry_count) {
            TaskTransition::Retry {
                run_at: now + self.backoff(retry_count),
                reason,
                description,
            }
        } else {
            TaskTransition::Errored {
                reason,
                description,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub lease: Duration,
    pub execution_timeout: Duration,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    fn heartbeat(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }
}

/// What happened to a dispatch message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Task missing, terminal, or held by a live claim: the message was a duplicate.
    Skipped,
    /// The claim was lost mid-run; whoever holds it now owns the task.
    LeaseLost,
    /// The transition was applied.
    Finished(TaskTransition),
    /// The run completed but the claim had moved on by the time it was recorded.
    Superseded,
}

#[derive(Clone)]
pub struct CompileWorker {
    worker_id: String,
    store: Arc<dyn TaskStore>,
    artifacts: Arc<dyn ArtifactStore>,
    sandbox: Arc<dyn Sandbox>,
    fetcher: Arc<dyn SourceFetcher>,
    settings: WorkerSettings,
}

impl CompileWorker {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        artifacts: Arc<dyn ArtifactStore>,
        sandbox: Arc<dyn Sandbox>,
        fetcher: Arc<dyn SourceFetcher>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            artifacts,
            sandbox,
            fetcher,
            settings,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Handle one dispatch message for `key`.
    pub async fn process(&self, key: &TaskKey) -> Result<ProcessOutcome, RepoError> {
        let Some(claimed) = self
            .store
            .claim(key, &self.worker_id, self.settings.lease)
            .await?
        else {
            info!(
                target = "texcompiler::worker",
                op = "worker::claim",
                task_id = %key,
                worker_id = %self.worker_id,
                "Dropped duplicate or stale dispatch"
            );
            return Ok(ProcessOutcome::Skipped);
        };

        info!(
            target = "texcompiler::worker",
            op = "worker::claim",
            task_id = %key,
            worker_id = %self.worker_id,
            attempt_count = claimed.task.attempt_count,
            retry_count = claimed.task.retry_count,
            "Claimed task"
        );

        let request = RunRequest {
            key: key.clone(),
            stamp_label: claimed.task.stamp_label.clone(),
            stamp_link: claimed.task.stamp_link.clone(),
        };

        let started_at = Instant::now();
        let Some(result) = self.execute_with_heartbeat(&claimed.claim, &request).await else {
            return Ok(ProcessOutcome::LeaseLost);
        };
        let elapsed = started_at.elapsed();

        let result = self.persist(key, result).await;
        metrics::counter!("texcompiler_executions_total", "outcome" => result.outcome.as_str())
            .increment(1);
        metrics::histogram!("texcompiler_execution_ms").record(elapsed.as_millis() as f64);

        let transition = self.transition_for(claimed.task.retry_count, &result);
        if let TaskTransition::Retry { reason, .. } = &transition {
            metrics::counter!("texcompiler_retries_total", "reason" => reason.as_str())
                .increment(1);
        }

        let applied = self
            .store
            .finish(&claimed.claim, transition.clone())
            .await?;
        if !applied {
            warn!(
                target = "texcompiler::worker",
                op = "worker::finish",
                task_id = %key,
                worker_id = %self.worker_id,
                transition = transition.label(),
                "Claim superseded before the outcome was recorded"
            );
            return Ok(ProcessOutcome::Superseded);
        }

        match result.error() {
            None => info!(
                target = "texcompiler::worker",
                op = "worker::finish",
                task_id = %key,
                outcome = result.outcome.as_str(),
                transition = transition.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Compilation finished"
            ),
            Some(error) => warn!(
                target = "texcompiler::worker",
                op = "worker::finish",
                task_id = %key,
                outcome = result.outcome.as_str(),
                exit_code = result.exit_code.map(i64::from).unwrap_or(-1),
                transition = transition.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                error = %error,
                "Compilation did not succeed"
            ),
        }

        Ok(ProcessOutcome::Finished(transition))
    }

    /// Run the attempt while renewing the lease. `None` if the lease was lost, in which case
    /// the sandbox future is dropped and its process killed.
    async fn execute_with_heartbeat(
        &self,
        claim: &Claim,
        request: &RunRequest,
    ) -> Option<ExecutionResult> {
        let execution = execute(
            self.sandbox.as_ref(),
            self.fetcher.as_ref(),
            request,
            self.settings.execution_timeout,
        );
        tokio::pin!(execution);

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut execution => return Some(result),
                _ = heartbeat.tick() => {
                    match self.store.renew_lease(claim, self.settings.lease).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(
                                target = "texcompiler::worker",
                                op = "worker::heartbeat",
                                task_id = %claim.key,
                                worker_id = %self.worker_id,
                                "Lease lost; abandoning attempt"
                            );
                            return None;
                        }
                        Err(err) => {
                            warn!(
                                target = "texcompiler::worker",
                                op = "worker::heartbeat",
                                task_id = %claim.key,
                                error = %err,
                                "Lease renewal failed; will retry"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Store the log, and the artifact on success. A failed artifact write downgrades the
    /// result to an infrastructure error so the task is never `completed` without a product.
    async fn persist(&self, key: &TaskKey, result: ExecutionResult) -> ExecutionResult {
        if let Err(err) = self
            .artifacts
            .put(&log_key(key), result.log_bytes.clone())
            .await
        {
            warn!(
                target = "texcompiler::worker",
                op = "worker::persist",
                task_id = %key,
                error = %err,
                "Failed to store compilation log"
            );
        }

        let Some(artifact) = result.artifact_bytes.clone() else {
            return result;
        };
        if result.outcome != ExecutionOutcome::Success {
            return result;
        }

        match self.artifacts.put(&artifact_key(key), artifact).await {
            Ok(()) => result,
            Err(err) => {
                warn!(
                    target = "texcompiler::worker",
                    op = "worker::persist",
                    task_id = %key,
                    error = %err,
                    "Failed to store artifact"
                );
                ExecutionResult::infra_error(
                    FailureReason::StorageFailure,
                    format!("failed to store artifact: {err}"),
                )
                .with_log(result.log_bytes)
                .with_exit_code(result.exit_code)
            }
        }
    }

    fn transition_for(&self, retry_count: i32, result: &ExecutionResult) -> TaskTransition {
        match result.outcome {
            ExecutionOutcome::Success => TaskTransition::Completed {
                size_bytes: result
                    .artifact_bytes
                    .as_ref()
                    .map_or(0, |bytes| bytes.len() as i64),
            },
            ExecutionOutcome::CompileFailure => TaskTransition::Failed {
                reason: FailureReason::CompilationErrors,
                description: result.failure_detail(),
            },
            ExecutionOutcome::InfraError | ExecutionOutcome::Timeout => {
                self.settings.retry.transition(
                    retry_count,
                    result.failure_reason(),
                    result.failure_detail(),
                    OffsetDateTime::now_utc(),
                )
            }
        }
    }
}

/// Recovers tasks whose worker died mid-attempt.
#[derive(Clone)]
pub struct LeaseReaper {
    store: Arc<dyn TaskStore>,
    retry: RetryPolicy,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn TaskStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Requeue (or error out) every task whose lease expired before `now`.
    pub async fn sweep(&self, now: OffsetDateTime) -> Result<usize, RepoError> {
        let expired = self.store.expired_leases(now, REAP_BATCH).await?;
        let mut reaped = 0;

        for ExpiredLease { claim, retry_count } in expired {
            let transition = self.retry.transition(
                retry_count,
                FailureReason::WorkerLost,
                WORKER_LOST_DESCRIPTION.to_string(),
                now,
            );
            if self.store.reap(&claim, transition.clone(), now).await? {
                reaped += 1;
                warn!(
                    target = "texcompiler::reaper",
                    op = "reaper::sweep",
                    task_id = %claim.key,
                    worker_id = %claim.worker_id,
                    transition = transition.label(),
                    "Reclaimed task from expired lease"
                );
            }
        }

        if reaped > 0 {
            metrics::counter!("texcompiler_leases_reaped_total").increment(reaped as u64);
        }
        Ok(reaped)
    }
}
