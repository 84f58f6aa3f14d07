//! Transfer task execution.
//!
//! Routes each [`Task`] variant to the component handling it. Activity and
//! workflow tasks are checked against mutable state before dispatch so that
//! completed or retried work is not pushed to matching again.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::deletion::{DeleteCoordinator, DeleteManager};
use crate::dispatch::TaskDispatcher;
use crate::error::HistoryResult;
use crate::matching::MatchingClient;
use crate::namespace::NamespaceRegistry;
use crate::shard::ShardContext;
use crate::tasks::{ActivityTask, CloseExecutionTask, DeleteStage, Task, WorkflowKey, WorkflowTask};
use crate::version::check_task_version_for_namespace;
use crate::workflow::{
    load_mutable_state_for_task, ExecutionKind, LockPriority, MutableState, MutableStateStore,
    TransactionPolicy, WorkflowLease,
};

/// Executes transfer tasks of one shard.
#[derive(Clone)]
pub struct TransferTaskExecutor {
    shard: Arc<ShardContext>,
    store: Arc<dyn MutableStateStore>,
    namespaces: Arc<dyn NamespaceRegistry>,
    dispatcher: TaskDispatcher,
    deletion: DeleteCoordinator,
}

impl TransferTaskExecutor {
    pub fn new(
        shard: Arc<ShardContext>,
        matching: Arc<dyn MatchingClient>,
        store: Arc<dyn MutableStateStore>,
        delete_manager: Arc<dyn DeleteManager>,
        namespaces: Arc<dyn NamespaceRegistry>,
    ) -> Self {
        let dispatcher = TaskDispatcher::new(shard.clone(), matching, store.clone());
        let deletion = DeleteCoordinator::new(shard.clone(), store.clone(), delete_manager);
        Self {
            shard,
            store,
            namespaces,
            dispatcher,
            deletion,
        }
    }

    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// Execute `task`. Progress that must survive a retry, such as the
    /// deletion stage, is recorded on the task itself.
    pub async fn execute(&self, task: &mut Task) -> HistoryResult<()> {
        match task {
            Task::Activity(task) => self.process_activity_task(task).await,
            Task::WorkflowTask(task) => self.process_workflow_task(task).await,
            Task::CloseExecution(task) => self.process_close_execution(task).await,
            Task::DeleteExecution(task) => {
                let namespace = self.namespaces.get_namespace_by_id(&task.key.namespace_id)?;
                // Only the active cluster writes close tasks, so only it can
                // wait for them.
                let ensure_no_pending_close = namespace.is_active_in(self.shard.cluster_name());
                self.deletion
                    .process_delete_execution_task(task, ensure_no_pending_close)
                    .await
            }
        }
    }

    fn transaction_policy(&self, namespace_id: &str) -> HistoryResult<TransactionPolicy> {
        let namespace = self.namespaces.get_namespace_by_id(namespace_id)?;
        if namespace.is_active_in(self.shard.cluster_name()) {
            Ok(TransactionPolicy::Active)
        } else {
            Ok(TransactionPolicy::Passive)
        }
    }

    async fn process_activity_task(&self, task: &ActivityTask) -> HistoryResult<()> {
        let policy = self.transaction_policy(&task.key.namespace_id)?;
        let Some(state) = self
            .load_for_dispatch(&task.key, task.scheduled_event_id)
            .await?
        else {
            return Ok(());
        };

        match state.pending_activities.get(&task.scheduled_event_id) {
            Some(activity) if activity.stamp == task.stamp => {}
            Some(activity) => {
                debug!(
                    workflow = %task.key,
                    task_stamp = task.stamp,
                    current_stamp = activity.stamp,
                    "Activity was retried, dropping stale dispatch"
                );
                return Ok(());
            }
            None => {
                debug!(
                    workflow = %task.key,
                    scheduled_event_id = task.scheduled_event_id,
                    "Activity no longer pending, skipping dispatch"
                );
                return Ok(());
            }
        }

        self.dispatcher
            .push_activity(
                task,
                task.schedule_to_start_timeout.unwrap_or(Duration::ZERO),
                &task.directive,
                task.priority.as_ref(),
                policy,
            )
            .await
    }

    async fn process_workflow_task(&self, task: &WorkflowTask) -> HistoryResult<()> {
        let policy = self.transaction_policy(&task.key.namespace_id)?;
        let Some(state) = self
            .load_for_dispatch(&task.key, task.scheduled_event_id)
            .await?
        else {
            return Ok(());
        };

        let pending = state
            .pending_workflow_task
            .as_ref()
            .is_some_and(|wt| wt.scheduled_event_id == task.scheduled_event_id);
        if !pending {
            debug!(
                workflow = %task.key,
                scheduled_event_id = task.scheduled_event_id,
                "Workflow task no longer pending, skipping dispatch"
            );
            return Ok(());
        }

        self.dispatcher
            .push_workflow_task(
                task,
                &task.task_queue,
                task.schedule_to_start_timeout.unwrap_or(Duration::ZERO),
                &task.directive,
                task.priority.as_ref(),
                policy,
            )
            .await
    }

    /// Snapshot mutable state for a dispatch decision. The lock is released
    /// before matching is called.
    async fn load_for_dispatch(
        &self,
        key: &WorkflowKey,
        event_id: i64,
    ) -> HistoryResult<Option<MutableState>> {
        const OP: &str = "load mutable state";
        let op_timeout = self.shard.config().op_timeout();
        let deadline = Instant::now() + op_timeout;
        let lease = self
            .lock_high(OP, op_timeout, deadline, key, ExecutionKind::Workflow)
            .await?;
        let result = self
            .shard
            .with_deadline_at(
                OP,
                op_timeout,
                deadline,
                load_mutable_state_for_task(&lease, self.store.as_ref(), Some(event_id)),
            )
            .await;
        lease.release(result.as_ref().map(|_| ()));
        result
    }

    /// Lock `key` ahead of deletion traffic, giving up at `deadline`.
    async fn lock_high(
        &self,
        op: &str,
        timeout: Duration,
        deadline: Instant,
        key: &WorkflowKey,
        kind: ExecutionKind,
    ) -> HistoryResult<WorkflowLease> {
        self.shard
            .with_deadline_at(
                op,
                timeout,
                deadline,
                self.shard.cache().get_or_create(
                    key,
                    kind,
                    LockPriority::High,
                    self.shard.cancellation_token(),
                ),
            )
            .await
    }

    async fn process_close_execution(&self, task: &CloseExecutionTask) -> HistoryResult<()> {
        const OP: &str = "load closed workflow";
        let op_timeout = self.shard.config().op_timeout();
        let deadline = Instant::now() + op_timeout;
        let lease = self
            .lock_high(OP, op_timeout, deadline, &task.key, ExecutionKind::Any)
            .await?;
        let result: HistoryResult<bool> = self
            .shard
            .with_deadline_at(OP, op_timeout, deadline, async {
                let Some(state) =
                    load_mutable_state_for_task(&lease, self.store.as_ref(), None).await?
                else {
                    return Ok(false);
                };
                let close_version = state.close_version()?;
                check_task_version_for_namespace(&state.namespace, close_version, task.version)?;
                Ok(true)
            })
            .await;
        lease.release(result.as_ref().map(|_| ()));
        let closed = result?;

        if !closed || !task.delete_after_close {
            return Ok(());
        }

        info!(workflow = %task.key, "Deleting workflow after close");
        // This task is the close task the guard would wait for.
        let mut stage = DeleteStage::None;
        self.deletion
            .delete_execution(&task.key, task.version, false, &mut stage)
            .await
    }
}
