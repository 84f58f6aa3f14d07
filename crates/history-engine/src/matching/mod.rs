//! Boundary to the worker-queue (matching) service.
//!
//! - [`MatchingClient`]: the calls this core makes
//! - [`HttpMatchingClient`]: JSON-over-HTTP implementation

mod http;

pub use http::HttpMatchingClient;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HistoryResult;
use crate::vclock::VectorClock;

/// Kind of a task queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueueKind {
    #[default]
    Normal,
    /// Worker-specific queue used for workflow task affinity.
    Sticky,
}

/// Task queue addressed by a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueue {
    pub name: String,
    #[serde(default)]
    pub kind: TaskQueueKind,
}

impl TaskQueue {
    pub fn normal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskQueueKind::Normal,
        }
    }
}

/// Task types a task queue serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueueType {
    Workflow,
    Activity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

/// Build-id routing instruction attached to a dispatched task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "build_id", rename_all = "snake_case")]
pub enum VersionDirective {
    /// The task is not versioned.
    #[default]
    Unversioned,
    /// Matching picks a build id from the namespace assignment rules. The
    /// chosen id has to be written back to mutable state.
    UseAssignmentRules,
    /// The task is already pinned to a build id.
    AssignedBuildId(String),
}

impl VersionDirective {
    pub fn uses_assignment_rules(&self) -> bool {
        matches!(self, VersionDirective::UseAssignmentRules)
    }
}

/// Execution priority hint forwarded to matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority {
    pub priority_key: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fairness_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddActivityTaskRequest {
    pub namespace_id: String,
    pub execution: WorkflowExecution,
    pub task_queue: TaskQueue,
    pub scheduled_event_id: i64,
    pub schedule_to_start_timeout: Option<Duration>,
    pub clock: VectorClock,
    pub version_directive: VersionDirective,
    pub stamp: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddWorkflowTaskRequest {
    pub namespace_id: String,
    pub execution: WorkflowExecution,
    pub task_queue: TaskQueue,
    pub scheduled_event_id: i64,
    /// `None` means no schedule-to-start timeout.
    pub schedule_to_start_timeout: Option<Duration>,
    pub clock: VectorClock,
    pub version_directive: VersionDirective,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTaskResponse {
    /// Build id picked by assignment rules, if any.
    #[serde(default)]
    pub assigned_build_id: Option<String>,
}

/// Routing data of a worker deployment version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVersionData {
    /// `None` targets unversioned workers.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub routing_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ramping_since_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ramp_percentage: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UserDataOperation {
    UpdateVersionData { data: DeploymentVersionData },
    ForgetVersion { version: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUserDataRequest {
    pub namespace_id: String,
    pub task_queue: String,
    pub task_queue_types: Vec<TaskQueueType>,
    pub operation: UserDataOperation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUserDataResponse {
    /// User-data version of the task queue after the update.
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckUserDataPropagationRequest {
    pub namespace_id: String,
    pub task_queue: String,
    pub version: i64,
}

/// Calls into the matching service.
///
/// Implementations map a missing task queue or workflow to
/// [`HistoryError::NotFound`](crate::HistoryError::NotFound); the dispatcher
/// relies on that classification.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    async fn add_activity_task(&self, request: AddActivityTaskRequest)
        -> HistoryResult<AddTaskResponse>;

    async fn add_workflow_task(&self, request: AddWorkflowTaskRequest)
        -> HistoryResult<AddTaskResponse>;

    async fn sync_deployment_user_data(
        &self,
        request: SyncUserDataRequest,
    ) -> HistoryResult<SyncUserDataResponse>;

    /// Resolves once `version` of the task queue user data reached all
    /// partitions.
    async fn check_user_data_propagation(
        &self,
        request: CheckUserDataPropagationRequest,
    ) -> HistoryResult<()>;
}
