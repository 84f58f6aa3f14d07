//! Queued task types.
//!
//! The set of task types is small and fixed, so a task is a closed enum and
//! the executor dispatches over it with a single `match`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, HistoryResult};
use crate::matching::{Priority, TaskQueue, VersionDirective};

/// Identity of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowKey {
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl std::fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}

/// Shard queue a task lives in. Ack levels are tracked per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Transfer,
    Timer,
    Visibility,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transfer => write!(f, "transfer"),
            Self::Timer => write!(f, "timer"),
            Self::Visibility => write!(f, "visibility"),
        }
    }
}

/// Furthest step reached by a (possibly interrupted) workflow deletion.
///
/// Stages are ordered; a retry skips every stage at or below the recorded one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStage {
    #[default]
    None,
    Visibility,
    Current,
    MutableState,
    History,
}

impl DeleteStage {
    /// Whether `stage` was already completed by an earlier attempt.
    pub fn is_processed(&self, stage: DeleteStage) -> bool {
        stage <= *self
    }

    /// Record that `stage` completed. Never moves backwards.
    pub fn advance_to(&mut self, stage: DeleteStage) {
        if stage > *self {
            *self = stage;
        }
    }

    pub fn is_complete(&self) -> bool {
        *self == DeleteStage::History
    }
}

/// Push an activity to its task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub key: WorkflowKey,
    pub task_id: i64,
    pub visibility_time: DateTime<Utc>,
    #[serde(default)]
    pub version: Option<i64>,
    pub task_queue: String,
    pub scheduled_event_id: i64,
    #[serde(default)]
    pub stamp: i32,
    #[serde(default)]
    pub schedule_to_start_timeout: Option<Duration>,
    #[serde(default)]
    pub directive: VersionDirective,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// Push a workflow task to its task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub key: WorkflowKey,
    pub task_id: i64,
    pub visibility_time: DateTime<Utc>,
    #[serde(default)]
    pub version: Option<i64>,
    pub task_queue: TaskQueue,
    pub scheduled_event_id: i64,
    #[serde(default)]
    pub schedule_to_start_timeout: Option<Duration>,
    #[serde(default)]
    pub directive: VersionDirective,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// Notification that a workflow run closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseExecutionTask {
    pub key: WorkflowKey,
    pub task_id: i64,
    pub visibility_time: DateTime<Utc>,
    #[serde(default)]
    pub version: Option<i64>,
    /// Delete the run right after processing the close (zero retention).
    #[serde(default)]
    pub delete_after_close: bool,
}

/// Erase the durable state of a closed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteExecutionTask {
    pub key: WorkflowKey,
    pub task_id: i64,
    pub visibility_time: DateTime<Utc>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub process_stage: DeleteStage,
}

/// A unit of queued work owned by one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Activity(ActivityTask),
    WorkflowTask(WorkflowTask),
    CloseExecution(CloseExecutionTask),
    DeleteExecution(DeleteExecutionTask),
}

impl Task {
    /// Decode a persisted task payload.
    pub fn decode(payload: &[u8]) -> HistoryResult<Self> {
        let task: Task = serde_json::from_slice(payload)?;
        if task.task_id() <= 0 {
            return Err(HistoryError::MalformedTask(format!(
                "invalid task id {}",
                task.task_id()
            )));
        }
        Ok(task)
    }

    pub fn encode(&self) -> HistoryResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| HistoryError::Internal(e.to_string()))
    }

    pub fn key(&self) -> &WorkflowKey {
        match self {
            Task::Activity(t) => &t.key,
            Task::WorkflowTask(t) => &t.key,
            Task::CloseExecution(t) => &t.key,
            Task::DeleteExecution(t) => &t.key,
        }
    }

    pub fn task_id(&self) -> i64 {
        match self {
            Task::Activity(t) => t.task_id,
            Task::WorkflowTask(t) => t.task_id,
            Task::CloseExecution(t) => t.task_id,
            Task::DeleteExecution(t) => t.task_id,
        }
    }

    /// Failover version the task was created at, `None` when the task must
    /// not be version checked.
    pub fn version(&self) -> Option<i64> {
        match self {
            Task::Activity(t) => t.version,
            Task::WorkflowTask(t) => t.version,
            Task::CloseExecution(t) => t.version,
            Task::DeleteExecution(t) => t.version,
        }
    }

    pub fn visibility_time(&self) -> DateTime<Utc> {
        match self {
            Task::Activity(t) => t.visibility_time,
            Task::WorkflowTask(t) => t.visibility_time,
            Task::CloseExecution(t) => t.visibility_time,
            Task::DeleteExecution(t) => t.visibility_time,
        }
    }

    /// Every task handled by this core lives in the transfer queue.
    pub fn category(&self) -> TaskCategory {
        TaskCategory::Transfer
    }

    /// History event the task refers to, used to detect stale cached state.
    pub fn event_id(&self) -> Option<i64> {
        match self {
            Task::Activity(t) => Some(t.scheduled_event_id),
            Task::WorkflowTask(t) => Some(t.scheduled_event_id),
            Task::CloseExecution(_) | Task::DeleteExecution(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Task::Activity(_) => "activity",
            Task::WorkflowTask(_) => "workflow_task",
            Task::CloseExecution(_) => "close_execution",
            Task::DeleteExecution(_) => "delete_execution",
        }
    }
}
