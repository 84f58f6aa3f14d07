//! Deletion of closed workflow executions.
//!
//! Deletion runs under the workflow lock at low priority and only touches
//! storage once every precondition held:
//!
//! 1. the run's close-execution task is acked (when the caller requires it)
//! 2. the delete task is not stale with respect to the run's close version
//!
//! Physical deletion is delegated to a [`DeleteManager`], which records the
//! furthest stage it reached so a retry resumes instead of restarting.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{HistoryError, HistoryResult};
use crate::queues::{is_task_acked, TaskRef};
use crate::shard::ShardContext;
use crate::tasks::{DeleteExecutionTask, DeleteStage, TaskCategory, WorkflowKey};
use crate::version::{check_task_version_for_namespace, effective_version};
use crate::workflow::{
    load_mutable_state_for_task, ExecutionKind, LockPriority, MutableState, MutableStateStore,
    WorkflowLease,
};

/// Physical deletion of a workflow's durable state.
#[async_trait]
pub trait DeleteManager: Send + Sync {
    /// Delete every stage after `stage`, advancing `stage` as each one
    /// completes, including when a later stage fails.
    async fn delete_workflow_execution(
        &self,
        namespace_id: &str,
        key: &WorkflowKey,
        lease: &WorkflowLease,
        state: &MutableState,
        stage: &mut DeleteStage,
    ) -> HistoryResult<()>;
}

/// Drives the deletion protocol for one shard.
#[derive(Clone)]
pub struct DeleteCoordinator {
    shard: Arc<ShardContext>,
    store: Arc<dyn MutableStateStore>,
    delete_manager: Arc<dyn DeleteManager>,
}

impl DeleteCoordinator {
    pub fn new(
        shard: Arc<ShardContext>,
        store: Arc<dyn MutableStateStore>,
        delete_manager: Arc<dyn DeleteManager>,
    ) -> Self {
        Self {
            shard,
            store,
            delete_manager,
        }
    }

    /// Process a delete task, persisting deletion progress on the task.
    pub async fn process_delete_execution_task(
        &self,
        task: &mut DeleteExecutionTask,
        ensure_no_pending_close: bool,
    ) -> HistoryResult<()> {
        let key = task.key.clone();
        self.delete_execution(&key, task.version, ensure_no_pending_close, &mut task.process_stage)
            .await
    }

    /// Delete the run `key`.
    ///
    /// `ensure_no_pending_close` must be set iff the namespace is active in
    /// this cluster and the call does not come from the run's own
    /// close-execution task, which would otherwise wait for itself.
    pub async fn delete_execution(
        &self,
        key: &WorkflowKey,
        task_version: Option<i64>,
        ensure_no_pending_close: bool,
        stage: &mut DeleteStage,
    ) -> HistoryResult<()> {
        const OP: &str = "delete workflow execution";
        let timeout = self.shard.config().task_timeout();
        let deadline = Instant::now() + timeout;
        let lease = self
            .shard
            .with_deadline_at(
                OP,
                timeout,
                deadline,
                self.shard.cache().get_or_create(
                    key,
                    ExecutionKind::Any,
                    LockPriority::Low,
                    self.shard.cancellation_token(),
                ),
            )
            .await?;

        // the lease outlives the deadline so it is released with the error
        // that aborted the deletion
        let result = self
            .shard
            .with_deadline_at(
                OP,
                timeout,
                deadline,
                self.delete_with_lease(&lease, task_version, ensure_no_pending_close, stage),
            )
            .await;
        lease.release(result.as_ref().map(|_| ()));
        result
    }

    async fn delete_with_lease(
        &self,
        lease: &WorkflowLease,
        task_version: Option<i64>,
        ensure_no_pending_close: bool,
        stage: &mut DeleteStage,
    ) -> HistoryResult<()> {
        let key = lease.key();
        let Some(state) = load_mutable_state_for_task(lease, self.store.as_ref(), None).await?
        else {
            info!(workflow = %key, "Workflow already deleted");
            return Ok(());
        };

        // Ack levels are persisted with a delay, so a close task that did
        // complete may still look pending here.
        if ensure_no_pending_close && self.is_close_execution_task_pending(&state, key) {
            debug!(
                workflow = %key,
                close_transfer_task_id = state.execution_info.close_transfer_task_id,
                "Close execution task not acked yet, deferring deletion"
            );
            return Err(HistoryError::DependencyTaskNotCompleted);
        }

        if let Some(task_version) = effective_version(task_version) {
            let close_version = state.close_version()?;
            check_task_version_for_namespace(&state.namespace, close_version, Some(task_version))?;
        }

        self.delete_manager
            .delete_workflow_execution(&key.namespace_id, key, lease, &state, stage)
            .await?;

        lease.context().clear();
        info!(workflow = %key, stage = ?stage, "Workflow execution deleted");
        Ok(())
    }

    fn is_close_execution_task_pending(&self, state: &MutableState, key: &WorkflowKey) -> bool {
        let close_transfer_task_id = state.execution_info.close_transfer_task_id;
        // zero for runs closed before the id was recorded
        if close_transfer_task_id == 0 {
            return false;
        }
        let Some(queue_state) = self.shard.queue_state(TaskCategory::Transfer) else {
            return true;
        };
        let close_task = TaskRef::close_execution(key.clone(), close_transfer_task_id);
        !is_task_acked(&close_task, &queue_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::QueueState;
    use crate::testing::{
        closed_state, running_state, test_shard, MemoryStore, RecordingDeleteManager,
    };
    use std::time::Duration;

    struct Fixture {
        shard: Arc<ShardContext>,
        store: Arc<MemoryStore>,
        deleter: Arc<RecordingDeleteManager>,
        coordinator: DeleteCoordinator,
    }

    fn fixture(store: MemoryStore, deleter: RecordingDeleteManager) -> Fixture {
        let shard = test_shard();
        let store = Arc::new(store);
        let deleter = Arc::new(deleter);
        let coordinator = DeleteCoordinator::new(shard.clone(), store.clone(), deleter.clone());
        Fixture {
            shard,
            store,
            deleter,
            coordinator,
        }
    }

    fn key() -> WorkflowKey {
        WorkflowKey::new("ns1", "wf1", "run1")
    }

    #[tokio::test]
    async fn test_pending_close_task_blocks_deletion() {
        let f = fixture(
            MemoryStore::with_state(closed_state(100, 5)),
            RecordingDeleteManager::new(),
        );
        f.shard
            .queue_states()
            .set(TaskCategory::Transfer, QueueState::new(50));

        let mut stage = DeleteStage::None;
        let err = f
            .coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap_err();

        assert!(matches!(err, HistoryError::DependencyTaskNotCompleted));
        assert_eq!(f.deleter.call_count(), 0);
        assert!(!f.shard.cache().is_locked(&key()));
        let stats = f.shard.cache().stats();
        assert_eq!(stats.released, 1);
        assert_eq!(
            stats.last_release_error.as_deref(),
            Some("Dependency task not completed")
        );
    }

    #[tokio::test]
    async fn test_ack_level_at_close_task_is_still_pending() {
        let f = fixture(
            MemoryStore::with_state(closed_state(100, 5)),
            RecordingDeleteManager::new(),
        );
        f.shard
            .queue_states()
            .set(TaskCategory::Transfer, QueueState::new(100));

        let mut stage = DeleteStage::None;
        let result = f.coordinator.delete_execution(&key(), None, true, &mut stage).await;
        assert!(matches!(result, Err(HistoryError::DependencyTaskNotCompleted)));
        assert_eq!(f.deleter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_acked_close_task_allows_deletion() {
        let f = fixture(
            MemoryStore::with_state(closed_state(100, 5)),
            RecordingDeleteManager::new(),
        );
        f.shard
            .queue_states()
            .set(TaskCategory::Transfer, QueueState::new(101));

        let mut stage = DeleteStage::None;
        f.coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap();
        assert_eq!(f.deleter.call_count(), 1);
        assert_eq!(stage, DeleteStage::History);
        assert_eq!(f.store.load_count(), 1);
        assert!(!f.shard.cache().is_cached(&key()));
    }

    #[tokio::test]
    async fn test_out_of_order_ack_allows_deletion() {
        let f = fixture(
            MemoryStore::with_state(closed_state(100, 5)),
            RecordingDeleteManager::new(),
        );
        f.shard
            .queue_states()
            .set(TaskCategory::Transfer, QueueState::new(50));
        f.shard.queue_states().mark_acked(TaskCategory::Transfer, 100);

        let mut stage = DeleteStage::None;
        f.coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap();
        assert_eq!(f.deleter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_queue_state_counts_as_pending() {
        let f = fixture(
            MemoryStore::with_state(closed_state(100, 5)),
            RecordingDeleteManager::new(),
        );

        let mut stage = DeleteStage::None;
        let result = f.coordinator.delete_execution(&key(), None, true, &mut stage).await;
        assert!(matches!(result, Err(HistoryError::DependencyTaskNotCompleted)));
    }

    #[tokio::test]
    async fn test_legacy_close_task_id_bypasses_guard() {
        let f = fixture(
            MemoryStore::with_state(closed_state(0, 5)),
            RecordingDeleteManager::new(),
        );
        f.shard
            .queue_states()
            .set(TaskCategory::Transfer, QueueState::new(1));

        let mut stage = DeleteStage::None;
        f.coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap();
        assert_eq!(f.deleter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_guard_disabled_ignores_queue_state() {
        let f = fixture(
            MemoryStore::with_state(closed_state(100, 5)),
            RecordingDeleteManager::new(),
        );
        f.shard
            .queue_states()
            .set(TaskCategory::Transfer, QueueState::new(50));

        let mut stage = DeleteStage::None;
        f.coordinator
            .delete_execution(&key(), None, false, &mut stage)
            .await
            .unwrap();
        assert_eq!(f.deleter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_aborts_deletion() {
        let f = fixture(
            MemoryStore::with_state(closed_state(0, 5)),
            RecordingDeleteManager::new(),
        );

        let mut stage = DeleteStage::None;
        let err = f
            .coordinator
            .delete_execution(&key(), Some(4), true, &mut stage)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HistoryError::VersionConflict {
                task_version: 4,
                current_version: 5
            }
        ));
        assert_eq!(f.deleter.call_count(), 0);
        assert!(!f.shard.cache().is_locked(&key()));
    }

    #[tokio::test]
    async fn test_matching_version_deletes() {
        let f = fixture(
            MemoryStore::with_state(closed_state(0, 5)),
            RecordingDeleteManager::new(),
        );

        let mut stage = DeleteStage::None;
        f.coordinator
            .delete_execution(&key(), Some(5), true, &mut stage)
            .await
            .unwrap();
        assert_eq!(f.deleter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_versioned_delete_of_running_workflow_fails() {
        let f = fixture(MemoryStore::with_state(running_state()), RecordingDeleteManager::new());

        let mut stage = DeleteStage::None;
        let err = f
            .coordinator
            .delete_execution(&key(), Some(5), false, &mut stage)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::InvalidState(_)));
        assert_eq!(f.deleter.call_count(), 0);
    }

    #[tokio::test]
    async fn test_already_deleted_workflow_is_done() {
        let f = fixture(MemoryStore::empty(), RecordingDeleteManager::new());

        let mut stage = DeleteStage::None;
        f.coordinator
            .delete_execution(&key(), Some(5), true, &mut stage)
            .await
            .unwrap();
        assert_eq!(f.deleter.call_count(), 0);
        assert_eq!(f.shard.cache().stats().released, 1);
    }

    #[tokio::test]
    async fn test_load_failure_releases_lock_with_error() {
        let store = MemoryStore::with_state(closed_state(0, 5))
            .failing_loads_with(|| HistoryError::Unavailable("store down".to_string()));
        let f = fixture(store, RecordingDeleteManager::new());

        let mut stage = DeleteStage::None;
        let err = f
            .coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Unavailable(_)));
        assert_eq!(f.deleter.call_count(), 0);

        let stats = f.shard.cache().stats();
        assert_eq!((stats.acquired, stats.released), (1, 1));
        assert_eq!(
            stats.last_release_error.as_deref(),
            Some("Service unavailable: store down")
        );
        assert!(!f.shard.cache().is_locked(&key()));
    }

    #[tokio::test]
    async fn test_partial_deletion_resumes_from_stage() {
        let f = fixture(
            MemoryStore::with_state(closed_state(0, 5)),
            RecordingDeleteManager::new().failing_at(DeleteStage::MutableState),
        );

        let mut stage = DeleteStage::None;
        let err = f
            .coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Unavailable(_)));
        assert_eq!(stage, DeleteStage::Current);
        let stats = f.shard.cache().stats();
        assert_eq!(stats.released, 1);
        assert!(stats.last_release_error.is_some());

        f.deleter.clear_failure();
        f.coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap();
        assert_eq!(stage, DeleteStage::History);
        assert_eq!(
            f.deleter.starting_stages(),
            vec![DeleteStage::None, DeleteStage::Current]
        );
        assert_eq!(f.shard.cache().stats().released, 2);
    }

    #[tokio::test]
    async fn test_unloaded_shard_aborts_deletion() {
        let f = fixture(
            MemoryStore::with_state(closed_state(0, 5)),
            RecordingDeleteManager::new(),
        );
        f.shard.unload();

        let mut stage = DeleteStage::None;
        let err = f
            .coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Cancelled));
        assert_eq!(f.deleter.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_deletion_times_out_and_releases() {
        let f = fixture(
            MemoryStore::with_state(closed_state(0, 5)),
            RecordingDeleteManager::new().with_delay(Duration::from_secs(60)),
        );

        let mut stage = DeleteStage::None;
        let err = f
            .coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Timeout(_)));
        assert!(!f.shard.cache().is_locked(&key()));
        let stats = f.shard.cache().stats();
        assert_eq!(stats.released, 1);
        assert_eq!(
            stats.last_release_error.as_deref(),
            Some("Operation timed out: delete workflow execution exceeded 10000ms")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_during_deletion_releases_with_cancellation() {
        let f = fixture(
            MemoryStore::with_state(closed_state(0, 5)),
            RecordingDeleteManager::new().with_delay(Duration::from_secs(5)),
        );
        let shard = f.shard.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shard.unload();
        });

        let mut stage = DeleteStage::None;
        let err = f
            .coordinator
            .delete_execution(&key(), None, true, &mut stage)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Cancelled));
        assert_eq!(
            f.shard.cache().stats().last_release_error.as_deref(),
            Some("Operation cancelled: shard context is no longer valid")
        );
    }

    #[tokio::test]
    async fn test_deleted_runs_leave_no_cached_context() {
        let f = fixture(MemoryStore::empty(), RecordingDeleteManager::new());
        let keys: Vec<WorkflowKey> = (0..100)
            .map(|i| WorkflowKey::new("ns1", "wf1", format!("run{}", i)))
            .collect();
        for key in &keys {
            let mut state = closed_state(0, 5);
            state.key = key.clone();
            f.store.put(state);
        }

        for key in &keys {
            let mut stage = DeleteStage::None;
            f.coordinator
                .delete_execution(key, None, true, &mut stage)
                .await
                .unwrap();
        }
        assert_eq!(f.deleter.call_count(), 100);
        assert!(f.shard.cache().is_empty());
    }

    #[tokio::test]
    async fn test_process_delete_task_persists_stage() {
        let f = fixture(
            MemoryStore::with_state(closed_state(0, 5)),
            RecordingDeleteManager::new(),
        );
        let mut task = DeleteExecutionTask {
            key: key(),
            task_id: 7,
            visibility_time: chrono::Utc::now(),
            version: None,
            process_stage: DeleteStage::Visibility,
        };

        f.coordinator
            .process_delete_execution_task(&mut task, true)
            .await
            .unwrap();
        assert_eq!(task.process_stage, DeleteStage::History);
        assert_eq!(f.deleter.starting_stages(), vec![DeleteStage::Visibility]);
    }
}
