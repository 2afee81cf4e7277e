//! Task worker loop.
//!
//! Polls the queue, executes through the registry, and reports success or
//! failure back so the queue can retry or dead-letter. Shuts down
//! cooperatively on the cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::TaskQueue;
use super::registry::TaskRegistry;

#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    pub worker_id: String,
    /// Tasks claimed per poll.
    pub batch_size: i64,
    /// Sleep when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            batch_size: 8,
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct TaskWorker {
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
    config: TaskWorkerConfig,
}

impl TaskWorker {
    pub fn new(queue: Arc<dyn TaskQueue>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            queue,
            registry,
            config: TaskWorkerConfig::default(),
        }
    }

    pub fn with_config(
        queue: Arc<dyn TaskQueue>,
        registry: Arc<TaskRegistry>,
        config: TaskWorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "task worker starting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let tasks = match self
                .queue
                .claim(&self.config.worker_id, self.config.batch_size)
                .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(error = %e, "failed to claim tasks");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            if tasks.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                }
            }

            for task in tasks {
                let task_id = task.id;
                match self.registry.execute(&task).await {
                    Ok(()) => {
                        debug!(task_id = %task_id, task_type = %task.task_type, "task succeeded");
                        if let Err(e) = self.queue.mark_succeeded(task_id).await {
                            error!(task_id = %task_id, error = %e, "failed to mark task succeeded");
                        }
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, task_type = %task.task_type, error = %e, "task failed");
                        if let Err(e) = self.queue.mark_failed(task_id, &e.to_string()).await {
                            error!(task_id = %task_id, error = %e, "failed to mark task failed");
                        }
                    }
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "task worker stopped");
    }
}
