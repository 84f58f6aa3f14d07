//! Shard-scoped context.
//!
//! Everything whose lifetime is tied to owning a shard lives here: the
//! workflow cache, the queue states and the cancellation token that fires
//! when ownership is lost. Nothing is process-global; unloading a shard
//! tears all of it down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::HistoryConfig;
use crate::error::{HistoryError, HistoryResult};
use crate::queues::{QueueState, QueueStates};
use crate::tasks::TaskCategory;
use crate::vclock::VectorClock;
use crate::workflow::WorkflowCache;

/// State owned by one shard of one engine instance.
#[derive(Debug)]
pub struct ShardContext {
    shard_id: i32,
    config: Arc<HistoryConfig>,
    queue_states: QueueStates,
    cache: WorkflowCache,
    cancel: CancellationToken,
}

impl ShardContext {
    pub fn new(shard_id: i32, config: Arc<HistoryConfig>) -> Self {
        let cache = WorkflowCache::with_capacity(config.workflow_cache_size);
        Self {
            shard_id,
            config,
            queue_states: QueueStates::new(),
            cache,
            cancel: CancellationToken::new(),
        }
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub fn cluster_id(&self) -> i64 {
        self.config.cluster_id
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn cache(&self) -> &WorkflowCache {
        &self.cache
    }

    pub fn queue_states(&self) -> &QueueStates {
        &self.queue_states
    }

    /// Snapshot of the queue state of `category`. Shard local, never blocks
    /// on I/O.
    pub fn queue_state(&self, category: TaskCategory) -> Option<QueueState> {
        self.queue_states.get(category)
    }

    /// Clock identifying task `task_id` of this shard.
    pub fn vector_clock(&self, task_id: i64) -> VectorClock {
        VectorClock::new(self.config.cluster_id, self.shard_id, task_id)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_valid(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Give up ownership: abort in-flight work and drop cached state.
    pub fn unload(&self) {
        info!(shard_id = self.shard_id, "Unloading shard");
        self.cancel.cancel();
        self.cache.purge();
    }

    /// Run `fut` bounded by `timeout` and by the shard's lifetime.
    pub async fn with_deadline<T, F>(&self, op: &str, timeout: Duration, fut: F) -> HistoryResult<T>
    where
        F: Future<Output = HistoryResult<T>>,
    {
        self.with_deadline_at(op, timeout, Instant::now() + timeout, fut)
            .await
    }

    /// Run `fut` until `deadline`, for operations whose `timeout` budget is
    /// spread over several awaits.
    pub async fn with_deadline_at<T, F>(
        &self,
        op: &str,
        timeout: Duration,
        deadline: Instant,
        fut: F,
    ) -> HistoryResult<T>
    where
        F: Future<Output = HistoryResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HistoryError::Cancelled),
            result = tokio::time::timeout_at(deadline, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(HistoryError::Timeout(format!(
                    "{} exceeded {}ms",
                    op,
                    timeout.as_millis()
                ))),
            },
        }
    }
}
