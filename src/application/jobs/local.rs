//! In-process dispatch for the memory backend.

use std::sync::Arc;

use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use tracing::{error, info};

use crate::application::worker::CompileWorker;
use crate::domain::task::TaskKey;

/// Drains the in-memory dispatch channel with bounded concurrency.
pub struct LocalWorkerPool {
    worker: Arc<CompileWorker>,
    concurrency: usize,
}

impl LocalWorkerPool {
    pub fn new(worker: Arc<CompileWorker>, concurrency: usize) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs until every sender of the channel is dropped.
    pub async fn run(self, receiver: UnboundedReceiver<TaskKey>) {
        info!(
            target = "texcompiler::jobs::local",
            worker_id = self.worker.worker_id(),
            concurrency = self.concurrency,
            "Local worker pool started"
        );

        let worker = self.worker;
        receiver
            .for_each_concurrent(self.concurrency, |key| {
                let worker = Arc::clone(&worker);
                async move {
                    if let Err(err) = worker.process(&key).await {
                        error!(
                            target = "texcompiler::jobs::local",
                            task_id = %key,
                            error = %err,
                            "Compile attempt failed to reach the task store"
                        );
                    }
                }
            })
            .await;
    }
}
