//! Per-shard task processing loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::error::{HistoryError, HistoryResult, TaskDisposition};
use crate::executor::TransferTaskExecutor;
use crate::result_ext::ResultExt;
use crate::tasks::Task;

/// A task together with the number of times it was already retried.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub task: Task,
    pub attempt: u32,
}

impl QueuedTask {
    pub fn new(task: Task) -> Self {
        Self { task, attempt: 0 }
    }

    /// Decode a persisted task payload on its `attempt`-th redelivery.
    pub fn decode(payload: &[u8], attempt: u32) -> HistoryResult<Self> {
        Ok(Self {
            task: Task::decode(payload)?,
            attempt,
        })
    }
}

/// Queue the processor pulls tasks from.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Next task ready for processing, `None` once the source is exhausted.
    ///
    /// Sources holding raw payloads decode them with [`QueuedTask::decode`].
    /// A payload that fails to decode is reported as
    /// [`HistoryError::MalformedTask`]; the processor logs and skips it, so
    /// the source must not deliver it again.
    async fn next_task(&self) -> HistoryResult<Option<QueuedTask>>;

    /// The task is done, successfully or not, and must not be delivered again.
    async fn complete(&self, task: &QueuedTask) -> HistoryResult<()>;

    /// Deliver the task again after `delay`.
    async fn reschedule(&self, task: QueuedTask, delay: Duration) -> HistoryResult<()>;
}

enum Outcome {
    Complete,
    Reschedule(Duration),
    Abandon,
}

/// Processes the tasks of one shard with bounded concurrency.
pub struct ShardProcessor {
    executor: TransferTaskExecutor,
    source: Arc<dyn TaskSource>,
    semaphore: Arc<Semaphore>,
    concurrency: u32,
}

impl ShardProcessor {
    pub fn new(executor: TransferTaskExecutor, source: Arc<dyn TaskSource>) -> Self {
        let max_concurrent_tasks = executor.shard().config().max_concurrent_tasks.max(1);
        let concurrency = u32::try_from(max_concurrent_tasks).unwrap_or(u32::MAX);
        Self {
            executor,
            source,
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            concurrency,
        }
    }

    /// Run until the shard is unloaded or the source is exhausted, then wait
    /// for in-flight tasks.
    ///
    /// A task that can be neither completed nor handed back to the source
    /// stops the processor, and `run` returns the source's error.
    pub async fn run(&self) -> HistoryResult<()> {
        let shard = self.executor.shard().clone();
        let cancel = shard.cancellation_token().child_token();
        let failure: Arc<Mutex<Option<HistoryError>>> = Arc::new(Mutex::new(None));
        info!(
            shard_id = shard.shard_id(),
            concurrency = self.concurrency,
            "Shard processor started"
        );

        let result = loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break Err(HistoryError::Internal(e.to_string())),
                },
            };

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                next = self.source.next_task() => next,
            };
            let queued = match next {
                Ok(Some(queued)) => queued,
                Ok(None) => {
                    debug!(shard_id = shard.shard_id(), "Task source exhausted");
                    break Ok(());
                }
                Err(HistoryError::MalformedTask(reason)) => {
                    error!(shard_id = shard.shard_id(), reason = %reason, "Skipping malformed task");
                    continue;
                }
                Err(e) => break Err(e),
            };

            let executor = self.executor.clone();
            let source = self.source.clone();
            let (cancel, failure) = (cancel.clone(), failure.clone());
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = process_task(&executor, source.as_ref(), queued).await {
                    failure
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .get_or_insert(e);
                    cancel.cancel();
                }
            });
        };

        // every in-flight task holds a permit
        let _drained = self
            .semaphore
            .acquire_many(self.concurrency)
            .await
            .map_err(|e| HistoryError::Internal(e.to_string()))?;
        info!(shard_id = shard.shard_id(), "Shard processor stopped");
        let failure = failure.lock().unwrap_or_else(|e| e.into_inner()).take();
        match failure {
            Some(e) => Err(e),
            None => result,
        }
    }
}

/// Execute one task and settle it with the source. Fails only if the task
/// could not be handed back for a retry.
async fn process_task(
    executor: &TransferTaskExecutor,
    source: &dyn TaskSource,
    mut queued: QueuedTask,
) -> HistoryResult<()> {
    let shard = executor.shard();
    let result = executor.execute(&mut queued.task).await.log_task(&queued.task);

    let outcome = match result {
        Ok(()) => Outcome::Complete,
        // the next owner of the shard reloads the task
        Err(_) if !shard.is_valid() => Outcome::Abandon,
        Err(e) => match e.disposition() {
            TaskDisposition::Drop | TaskDisposition::Fatal => Outcome::Complete,
            TaskDisposition::Retry => {
                Outcome::Reschedule(shard.config().retry_backoff(queued.attempt + 1))
            }
            TaskDisposition::RetryAfterAckPropagation => {
                Outcome::Reschedule(shard.config().ack_propagation_delay())
            }
        },
    };

    match outcome {
        Outcome::Complete => {
            let (category, task_id) = (queued.task.category(), queued.task.task_id());
            if source.complete(&queued).await.log("completing task").is_ok() {
                shard.queue_states().mark_acked(category, task_id);
            }
        }
        Outcome::Reschedule(delay) => {
            queued.attempt += 1;
            debug!(
                task_id = queued.task.task_id(),
                attempt = queued.attempt,
                delay_ms = delay.as_millis() as u64,
                "Rescheduling task"
            );
            let task_id = queued.task.task_id();
            if let Err(e) = source.reschedule(queued, delay).await {
                error!(
                    shard_id = shard.shard_id(),
                    task_id,
                    error = %e,
                    "Rescheduling task failed, stopping shard processor"
                );
                return Err(e);
            }
        }
        Outcome::Abandon => {
            debug!(task_id = queued.task.task_id(), "Shard unloaded, abandoning task");
        }
    }
    Ok(())
}
