//! Mutable state snapshot, the store boundary and the standard read path
//! used by every task that touches a workflow.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cache::WorkflowLease;
use crate::error::{HistoryError, HistoryResult};
use crate::namespace::NamespaceEntry;
use crate::tasks::WorkflowKey;

/// Kind of execution a mutable state belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Matches any kind. Only valid as a lookup filter.
    Any,
    #[default]
    Workflow,
    /// Executions without a workflow history, e.g. standalone activities.
    Standalone,
}

impl ExecutionKind {
    pub fn matches(self, actual: ExecutionKind) -> bool {
        self == ExecutionKind::Any || self == actual
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

impl WorkflowStatus {
    pub fn is_running(self) -> bool {
        self == WorkflowStatus::Running
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub status: WorkflowStatus,
    /// Failover version the run closed at. Meaningless while running.
    #[serde(default)]
    pub close_version: i64,
    /// Id of the run's own close-execution transfer task. Zero for runs that
    /// closed before the id was recorded.
    #[serde(default)]
    pub close_transfer_task_id: i64,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    pub next_event_id: i64,
    /// Build id the workflow was assigned by assignment rules.
    #[serde(default)]
    pub assigned_build_id: Option<String>,
    /// Version of the persisted record, used for conditional updates.
    pub db_record_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub scheduled_event_id: i64,
    /// Incremented on every retry of the activity.
    pub stamp: i32,
    pub task_queue: String,
    /// Build id assigned to this activity independently of the workflow.
    #[serde(default)]
    pub build_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTaskInfo {
    pub scheduled_event_id: i64,
    pub task_queue: String,
}

/// Authoritative snapshot of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableState {
    pub key: WorkflowKey,
    #[serde(default)]
    pub kind: ExecutionKind,
    pub namespace: NamespaceEntry,
    pub execution_info: ExecutionInfo,
    #[serde(default)]
    pub pending_activities: HashMap<i64, ActivityInfo>,
    #[serde(default)]
    pub pending_workflow_task: Option<WorkflowTaskInfo>,
}

/// Field-level change requested against mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutableStateMutation {
    SetActivityBuildId {
        scheduled_event_id: i64,
        build_id: String,
    },
    InitializeAssignedBuildId {
        build_id: String,
    },
}

/// Which cluster role a write is performed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPolicy {
    Active,
    Passive,
}

impl MutableState {
    pub fn is_running(&self) -> bool {
        self.execution_info.status.is_running()
    }

    /// Version the run closed at.
    pub fn close_version(&self) -> HistoryResult<i64> {
        if self.is_running() {
            return Err(HistoryError::InvalidState(format!(
                "workflow {} is still running, close version is undefined",
                self.key
            )));
        }
        Ok(self.execution_info.close_version)
    }

    /// Mutation recording the build id matching assigned to a dispatched
    /// activity, or `None` when the dispatched attempt is no longer current.
    pub fn activity_build_id_update(
        &self,
        scheduled_event_id: i64,
        stamp: i32,
        build_id: &str,
    ) -> Option<MutableStateMutation> {
        let activity = self.pending_activities.get(&scheduled_event_id)?;
        if activity.stamp != stamp {
            debug!(
                scheduled_event_id,
                dispatched_stamp = stamp,
                current_stamp = activity.stamp,
                "Activity was retried after dispatch, skipping build id update"
            );
            return None;
        }
        if activity.build_id.as_deref() == Some(build_id) {
            return None;
        }
        Some(MutableStateMutation::SetActivityBuildId {
            scheduled_event_id,
            build_id: build_id.to_string(),
        })
    }

    /// Mutation setting the workflow's assigned build id, or `None` when the
    /// dispatched workflow task is gone or a build id is already assigned.
    pub fn assigned_build_id_initialization(
        &self,
        scheduled_event_id: i64,
        build_id: &str,
    ) -> Option<MutableStateMutation> {
        let workflow_task = self.pending_workflow_task.as_ref()?;
        if workflow_task.scheduled_event_id != scheduled_event_id {
            return None;
        }
        if self.execution_info.assigned_build_id.is_some() {
            return None;
        }
        Some(MutableStateMutation::InitializeAssignedBuildId {
            build_id: build_id.to_string(),
        })
    }

    pub fn apply(&mut self, mutation: &MutableStateMutation) -> HistoryResult<()> {
        match mutation {
            MutableStateMutation::SetActivityBuildId {
                scheduled_event_id,
                build_id,
            } => {
                let activity = self
                    .pending_activities
                    .get_mut(scheduled_event_id)
                    .ok_or_else(|| {
                        HistoryError::InvalidState(format!(
                            "activity {} is not pending",
                            scheduled_event_id
                        ))
                    })?;
                activity.build_id = Some(build_id.clone());
            }
            MutableStateMutation::InitializeAssignedBuildId { build_id } => {
                self.execution_info.assigned_build_id = Some(build_id.clone());
            }
        }
        Ok(())
    }
}

/// Storage of mutable state. Owned by the persistence layer.
#[async_trait]
pub trait MutableStateStore: Send + Sync {
    /// Read the current snapshot. A missing run is
    /// [`HistoryError::NotFound`].
    async fn get_mutable_state(&self, key: &WorkflowKey) -> HistoryResult<MutableState>;

    /// Apply `mutations` if the stored record is still at
    /// `expected_db_record_version`. Returns the new record version.
    async fn update_mutable_state(
        &self,
        key: &WorkflowKey,
        policy: TransactionPolicy,
        expected_db_record_version: i64,
        mutations: Vec<MutableStateMutation>,
    ) -> HistoryResult<i64>;
}

async fn read_through(
    lease: &WorkflowLease,
    store: &dyn MutableStateStore,
) -> HistoryResult<Option<MutableState>> {
    if let Some(cached) = lease.context().cached_state() {
        return Ok(Some(cached));
    }
    match store.get_mutable_state(lease.key()).await {
        Ok(state) => {
            lease.context().set_cached_state(state.clone());
            Ok(Some(state))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Load mutable state for a task while holding the workflow lease.
///
/// Returns `None` when the run no longer exists or is not of the leased
/// execution kind. When `event_id` is at or beyond the cached
/// `next_event_id`, the cache is assumed stale and reloaded once; if the
/// store is still behind, the task is retried later with
/// [`HistoryError::StaleState`].
pub async fn load_mutable_state_for_task(
    lease: &WorkflowLease,
    store: &dyn MutableStateStore,
    event_id: Option<i64>,
) -> HistoryResult<Option<MutableState>> {
    let Some(mut state) = read_through(lease, store).await? else {
        info!(workflow = %lease.key(), "Mutable state not found, workflow already gone");
        return Ok(None);
    };

    if let Some(event_id) = event_id {
        if event_id >= state.execution_info.next_event_id {
            debug!(
                workflow = %lease.key(),
                event_id,
                next_event_id = state.execution_info.next_event_id,
                "Cached mutable state is behind task, reloading"
            );
            lease.context().clear();
            state = match read_through(lease, store).await? {
                Some(state) => state,
                None => return Ok(None),
            };
            if event_id >= state.execution_info.next_event_id {
                return Err(HistoryError::StaleState(format!(
                    "task event {} not yet in mutable state of {} (next event {})",
                    event_id, lease.key(), state.execution_info.next_event_id
                )));
            }
        }
    }

    if !lease.kind().matches(state.kind) {
        debug!(
            workflow = %lease.key(),
            requested = ?lease.kind(),
            actual = ?state.kind,
            "Execution kind mismatch, treating as not found"
        );
        return Ok(None);
    }

    Ok(Some(state))
}
