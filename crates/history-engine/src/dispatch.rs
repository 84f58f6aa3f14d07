//! Task dispatcher.
//!
//! Pushes activity and workflow tasks to matching and, when the version
//! directive asks matching to pick a build id, writes the picked id back to
//! mutable state in the same task-processing transaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::HistoryResult;
use crate::matching::{
    AddActivityTaskRequest, AddTaskResponse, AddWorkflowTaskRequest, MatchingClient, Priority,
    TaskQueue, VersionDirective, WorkflowExecution,
};
use crate::shard::ShardContext;
use crate::tasks::{ActivityTask, WorkflowKey, WorkflowTask};
use crate::workflow::{
    load_mutable_state_for_task, ExecutionKind, LockPriority, MutableState, MutableStateMutation,
    MutableStateStore, TransactionPolicy,
};

/// Dispatches tasks of one shard to matching.
///
/// Holds no long-lived resources; calls are independent and may run
/// concurrently. Deduplication of repeated dispatches is left to matching.
#[derive(Clone)]
pub struct TaskDispatcher {
    shard: Arc<ShardContext>,
    matching: Arc<dyn MatchingClient>,
    store: Arc<dyn MutableStateStore>,
}

fn execution(key: &WorkflowKey) -> WorkflowExecution {
    WorkflowExecution {
        workflow_id: key.workflow_id.clone(),
        run_id: key.run_id.clone(),
    }
}

impl TaskDispatcher {
    pub fn new(
        shard: Arc<ShardContext>,
        matching: Arc<dyn MatchingClient>,
        store: Arc<dyn MutableStateStore>,
    ) -> Self {
        Self {
            shard,
            matching,
            store,
        }
    }

    /// Push an activity task to its task queue.
    pub async fn push_activity(
        &self,
        task: &ActivityTask,
        schedule_to_start_timeout: Duration,
        directive: &VersionDirective,
        priority: Option<&Priority>,
        policy: TransactionPolicy,
    ) -> HistoryResult<()> {
        let request = AddActivityTaskRequest {
            namespace_id: task.key.namespace_id.clone(),
            execution: execution(&task.key),
            task_queue: TaskQueue::normal(&task.task_queue),
            scheduled_event_id: task.scheduled_event_id,
            schedule_to_start_timeout: Some(schedule_to_start_timeout),
            clock: self.shard.vector_clock(task.task_id),
            version_directive: directive.clone(),
            stamp: task.stamp,
            priority: priority.cloned(),
        };

        let op_timeout = self.shard.config().op_timeout();
        let result = self
            .shard
            .with_deadline(
                "add activity task",
                op_timeout,
                self.matching.add_activity_task(request),
            )
            .await;
        let Some(response) = self.accept_response(result, &task.key, task.task_id, "AddActivityTask")?
        else {
            return Ok(());
        };

        if !directive.uses_assignment_rules() {
            return Ok(());
        }
        let Some(build_id) = response.assigned_build_id else {
            debug!(task_id = task.task_id, "Matching assigned no build id to activity");
            return Ok(());
        };

        let (scheduled_event_id, stamp) = (task.scheduled_event_id, task.stamp);
        self.update_mutable_state(&task.key, scheduled_event_id, policy, move |state| {
            state.activity_build_id_update(scheduled_event_id, stamp, &build_id)
        })
        .await
    }

    /// Push a workflow task to `task_queue`.
    ///
    /// A zero `schedule_to_start_timeout` means no timeout and is not sent.
    pub async fn push_workflow_task(
        &self,
        task: &WorkflowTask,
        task_queue: &TaskQueue,
        schedule_to_start_timeout: Duration,
        directive: &VersionDirective,
        priority: Option<&Priority>,
        policy: TransactionPolicy,
    ) -> HistoryResult<()> {
        let request = AddWorkflowTaskRequest {
            namespace_id: task.key.namespace_id.clone(),
            execution: execution(&task.key),
            task_queue: task_queue.clone(),
            scheduled_event_id: task.scheduled_event_id,
            schedule_to_start_timeout: (!schedule_to_start_timeout.is_zero())
                .then_some(schedule_to_start_timeout),
            clock: self.shard.vector_clock(task.task_id),
            version_directive: directive.clone(),
            priority: priority.cloned(),
        };

        let op_timeout = self.shard.config().op_timeout();
        let result = self
            .shard
            .with_deadline(
                "add workflow task",
                op_timeout,
                self.matching.add_workflow_task(request),
            )
            .await;
        let Some(response) = self.accept_response(result, &task.key, task.task_id, "AddWorkflowTask")?
        else {
            return Ok(());
        };

        if !directive.uses_assignment_rules() {
            return Ok(());
        }
        let Some(build_id) = response.assigned_build_id else {
            debug!(task_id = task.task_id, "Matching assigned no build id to workflow");
            return Ok(());
        };

        let scheduled_event_id = task.scheduled_event_id;
        self.update_mutable_state(&task.key, scheduled_event_id, policy, move |state| {
            state.assigned_build_id_initialization(scheduled_event_id, &build_id)
        })
        .await
    }

    /// Not found is unexpected for add calls but ignorable: log it and treat
    /// the task as dispatched (`Ok(None)`).
    fn accept_response(
        &self,
        result: HistoryResult<AddTaskResponse>,
        key: &WorkflowKey,
        task_id: i64,
        call: &str,
    ) -> HistoryResult<Option<AddTaskResponse>> {
        match result {
            Ok(response) => Ok(Some(response)),
            Err(e) if e.is_not_found() => {
                error!(
                    shard_id = self.shard.shard_id(),
                    namespace_id = %key.namespace_id,
                    workflow_id = %key.workflow_id,
                    run_id = %key.run_id,
                    task_id,
                    error = %e,
                    "Matching returned not found error for {}",
                    call
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn update_mutable_state<F>(
        &self,
        key: &WorkflowKey,
        event_id: i64,
        policy: TransactionPolicy,
        plan: F,
    ) -> HistoryResult<()>
    where
        F: FnOnce(&MutableState) -> Option<MutableStateMutation> + Send,
    {
        const OP: &str = "update assigned build id";
        let op_timeout = self.shard.config().op_timeout();
        let deadline = Instant::now() + op_timeout;
        let lease = self
            .shard
            .with_deadline_at(
                OP,
                op_timeout,
                deadline,
                self.shard.cache().get_or_create(
                    key,
                    ExecutionKind::Workflow,
                    LockPriority::Normal,
                    self.shard.cancellation_token(),
                ),
            )
            .await?;

        let result = self
            .shard
            .with_deadline_at(OP, op_timeout, deadline, async {
                let Some(mut state) =
                    load_mutable_state_for_task(&lease, self.store.as_ref(), Some(event_id)).await?
                else {
                    return Ok(());
                };
                let Some(mutation) = plan(&state) else {
                    debug!(workflow = %key, "No build id update needed");
                    return Ok(());
                };

                let version = self
                    .store
                    .update_mutable_state(
                        key,
                        policy,
                        state.execution_info.db_record_version,
                        vec![mutation.clone()],
                    )
                    .await?;
                state.apply(&mutation)?;
                state.execution_info.db_record_version = version;
                lease.context().set_cached_state(state);

                info!(workflow = %key, ?mutation, ?policy, "Recorded assigned build id");
                Ok(())
            })
            .await;

        lease.release(result.as_ref().map(|_| ()));
        result
    }
}
