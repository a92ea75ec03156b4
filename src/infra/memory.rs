//! Single-process `TaskStore` for development and tests.
//!
//! Records live in a [`DashMap`]; every compare-and-set runs under the key's shard lock.
//! Dispatch messages go to an unbounded channel drained by
//! [`LocalWorkerPool`](crate::application::jobs::LocalWorkerPool).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::repos::{
    AdmitRequest, Admission, Claim, ClaimedTask, ExpiredLease, RepoError, TaskStore,
    TaskTransition,
};
use crate::domain::entities::CompilationTask;
use crate::domain::task::TaskKey;
use crate::domain::types::TaskStatus;

#[derive(Clone)]
pub struct InMemoryTaskStore {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: DashMap<TaskKey, CompilationTask>,
    dispatch: UnboundedSender<TaskKey>,
}

impl InMemoryTaskStore {
    /// A fresh store and the receiving end of its dispatch channel.
    pub fn new() -> (Self, UnboundedReceiver<TaskKey>) {
        let (dispatch, receiver) = mpsc::unbounded();
        let store = Self {
            inner: Arc::new(Inner {
                tasks: DashMap::new(),
                dispatch,
            }),
        };
        (store, receiver)
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.is_empty()
    }

    fn ensure_open(&self) -> Result<(), RepoError> {
        if self.inner.dispatch.is_closed() {
            return Err(RepoError::from_persistence("dispatch channel is closed"));
        }
        Ok(())
    }

    fn dispatch_now(&self, key: TaskKey) {
        if let Err(err) = self.inner.dispatch.unbounded_send(key) {
            warn!(
                target = "texcompiler::memory",
                task_id = %err.into_inner(),
                "Dispatch channel closed; message dropped"
            );
        }
    }

    fn dispatch_at(&self, key: TaskKey, run_at: OffsetDateTime) {
        let delay = run_at - OffsetDateTime::now_utc();
        let delay = Duration::try_from(delay).unwrap_or(Duration::ZERO);
        if delay.is_zero() {
            self.dispatch_now(key);
            return;
        }

        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.dispatch_now(key);
        });
    }

    fn apply_transition(
        &self,
        claim: &Claim,
        transition: TaskTransition,
        expired_before: Option<OffsetDateTime>,
    ) -> Result<bool, RepoError> {
        let Some(mut task) = self.inner.tasks.get_mut(&claim.key) else {
            return Ok(false);
        };
        if task.status != TaskStatus::InProgress || task.claim_id != Some(claim.claim_id) {
            return Ok(false);
        }
        if let Some(now) = expired_before
            && !task.lease_expires_at.is_some_and(|expires| expires < now)
        {
            return Ok(false);
        }

        let now = OffsetDateTime::now_utc();
        task.lease_owner = None;
        task.claim_id = None;
        task.lease_expires_at = None;
        task.updated_at = now;

        let requeue_at = match transition {
            TaskTransition::Completed { size_bytes } => {
                task.status = TaskStatus::Completed;
                task.reason = None;
                task.description = None;
                task.size_bytes = Some(size_bytes);
                task.completed_at = Some(now);
                None
            }
            TaskTransition::Failed {
                reason,
                description,
            } => {
                task.status = TaskStatus::Failed;
                task.reason = Some(reason);
                task.description = Some(description);
                task.size_bytes = None;
                task.completed_at = Some(now);
                None
            }
            TaskTransition::Errored {
                reason,
                description,
            } => {
                task.status = TaskStatus::Errored;
                task.reason = Some(reason);
                task.description = Some(description);
                task.size_bytes = None;
                task.completed_at = Some(now);
                None
            }
            TaskTransition::Retry {
                run_at,
                reason,
                description,
            } => {
                debug!(
                    target = "texcompiler::memory",
                    op = "memory::finish",
                    task_id = %claim.key,
                    reason = reason.as_str(),
                    description = %description,
                    "Requeueing task"
                );
                task.status = TaskStatus::Queued;
                task.reason = None;
                task.description = None;
                task.size_bytes = None;
                task.started_at = None;
                task.completed_at = None;
                task.attempt_count += 1;
                task.retry_count += 1;
                Some(run_at)
            }
        };
        drop(task);

        if let Some(run_at) = requeue_at {
            self.dispatch_at(claim.key.clone(), run_at);
        }
        Ok(true)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn admit(&self, request: AdmitRequest) -> Result<Admission, RepoError> {
        self.ensure_open()?;
        let AdmitRequest {
            key,
            options,
            force,
        } = request;
        let now = OffsetDateTime::now_utc();

        match self.inner.tasks.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let task = CompilationTask::queued(key.clone(), &options, now);
                vacant.insert(task.clone());
                self.dispatch_now(key);
                Ok(Admission {
                    task,
                    accepted: true,
                })
            }
            Entry::Occupied(mut occupied) => {
                let task = occupied.get_mut();
                if !(force && task.is_terminal()) {
                    return Ok(Admission {
                        task: task.clone(),
                        accepted: false,
                    });
                }

                task.status = TaskStatus::Queued;
                task.owner = options.owner;
                task.stamp_label = options.stamp_label;
                task.stamp_link = options.stamp_link;
                task.reason = None;
                task.description = None;
                task.size_bytes = None;
                task.attempt_count += 1;
                task.retry_count = 0;
                task.lease_owner = None;
                task.claim_id = None;
                task.lease_expires_at = None;
                task.started_at = None;
                task.completed_at = None;
                task.updated_at = now;
                let task = task.clone();
                drop(occupied);

                self.dispatch_now(key);
                Ok(Admission {
                    task,
                    accepted: true,
                })
            }
        }
    }

    async fn find(&self, key: &TaskKey) -> Result<Option<CompilationTask>, RepoError> {
        Ok(self.inner.tasks.get(key).map(|task| task.clone()))
    }

    async fn claim(
        &self,
        key: &TaskKey,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, RepoError> {
        let Some(mut task) = self.inner.tasks.get_mut(key) else {
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        let claimable = match task.status {
            TaskStatus::Queued => true,
            TaskStatus::InProgress => task.lease_expires_at.is_some_and(|expires| expires < now),
            _ => false,
        };
        if !claimable {
            return Ok(None);
        }

        let claim_id = Uuid::new_v4();
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        task.lease_owner = Some(worker_id.to_string());
        task.claim_id = Some(claim_id);
        task.lease_expires_at = Some(now + lease);
        task.updated_at = now;

        Ok(Some(ClaimedTask {
            claim: Claim {
                key: key.clone(),
                worker_id: worker_id.to_string(),
                claim_id,
            },
            task: task.clone(),
        }))
    }

    async fn renew_lease(&self, claim: &Claim, lease: Duration) -> Result<bool, RepoError> {
        let Some(mut task) = self.inner.tasks.get_mut(&claim.key) else {
            return Ok(false);
        };
        if task.status != TaskStatus::InProgress || task.claim_id != Some(claim.claim_id) {
            return Ok(false);
        }

        let now = OffsetDateTime::now_utc();
        task.lease_expires_at = Some(now + lease);
        task.updated_at = now;
        Ok(true)
    }

    async fn finish(&self, claim: &Claim, transition: TaskTransition) -> Result<bool, RepoError> {
        self.apply_transition(claim, transition, None)
    }

    async fn expired_leases(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ExpiredLease>, RepoError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut expired: Vec<(OffsetDateTime, ExpiredLease)> = self
            .inner
            .tasks
            .iter()
            .filter_map(|entry| {
                let task = entry.value();
                let expires = task.lease_expires_at?;
                let claim_id = task.claim_id?;
                (task.status == TaskStatus::InProgress && expires < now).then(|| {
                    (
                        expires,
                        ExpiredLease {
                            claim: Claim {
                                key: task.key.clone(),
                                worker_id: task.lease_owner.clone().unwrap_or_default(),
                                claim_id,
                            },
                            retry_count: task.retry_count,
                        },
                    )
                })
            })
            .collect();

        expired.sort_by_key(|(expires, _)| *expires);
        Ok(expired
            .into_iter()
            .take(limit)
            .map(|(_, lease)| lease)
            .collect())
    }

    async fn reap(
        &self,
        claim: &Claim,
        transition: TaskTransition,
        now: OffsetDateTime,
    ) -> Result<bool, RepoError> {
        self.apply_transition(claim, transition, Some(now))
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        self.ensure_open()
    }
}
