//! In-memory fakes and fixtures shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::HistoryConfig;
use crate::deletion::DeleteManager;
use crate::error::{HistoryError, HistoryResult};
use crate::matching::{
    AddActivityTaskRequest, AddTaskResponse, AddWorkflowTaskRequest,
    CheckUserDataPropagationRequest, MatchingClient, SyncUserDataRequest, SyncUserDataResponse,
    TaskQueue, VersionDirective,
};
use crate::namespace::NamespaceEntry;
use crate::shard::ShardContext;
use crate::tasks::{
    ActivityTask, CloseExecutionTask, DeleteExecutionTask, DeleteStage, Task, WorkflowKey,
    WorkflowTask,
};
use crate::workflow::{
    ActivityInfo, ExecutionInfo, ExecutionKind, MutableState, MutableStateMutation,
    MutableStateStore, TransactionPolicy, WorkflowLease, WorkflowStatus, WorkflowTaskInfo,
};

type ErrorFn = Box<dyn Fn() -> HistoryError + Send + Sync>;

pub fn key() -> WorkflowKey {
    WorkflowKey::new("ns1", "wf1", "run1")
}

pub fn namespace() -> NamespaceEntry {
    NamespaceEntry {
        id: "ns1".to_string(),
        name: "orders".to_string(),
        is_global: true,
        active_cluster: "active".to_string(),
    }
}

pub fn running_state() -> MutableState {
    let mut pending_activities = HashMap::new();
    pending_activities.insert(
        5,
        ActivityInfo {
            scheduled_event_id: 5,
            stamp: 1,
            task_queue: "orders-tq".to_string(),
            build_id: None,
        },
    );
    MutableState {
        key: key(),
        kind: ExecutionKind::Workflow,
        namespace: namespace(),
        execution_info: ExecutionInfo {
            status: WorkflowStatus::Running,
            close_version: 0,
            close_transfer_task_id: 0,
            close_time: None,
            next_event_id: 10,
            assigned_build_id: None,
            db_record_version: 1,
        },
        pending_activities,
        pending_workflow_task: Some(WorkflowTaskInfo {
            scheduled_event_id: 3,
            task_queue: "orders-tq".to_string(),
        }),
    }
}

pub fn closed_state(close_transfer_task_id: i64, close_version: i64) -> MutableState {
    let mut state = running_state();
    state.execution_info.status = WorkflowStatus::Completed;
    state.execution_info.close_transfer_task_id = close_transfer_task_id;
    state.execution_info.close_version = close_version;
    state.execution_info.close_time = Some(Utc::now());
    state.pending_activities.clear();
    state.pending_workflow_task = None;
    state
}

pub fn activity_task(task_id: i64, directive: VersionDirective) -> Task {
    Task::Activity(ActivityTask {
        key: key(),
        task_id,
        visibility_time: Utc::now(),
        version: None,
        task_queue: "orders-tq".to_string(),
        scheduled_event_id: 5,
        stamp: 1,
        schedule_to_start_timeout: Some(Duration::from_secs(10)),
        directive,
        priority: None,
    })
}

pub fn workflow_task(task_id: i64, directive: VersionDirective) -> Task {
    Task::WorkflowTask(WorkflowTask {
        key: key(),
        task_id,
        visibility_time: Utc::now(),
        version: None,
        task_queue: TaskQueue::normal("orders-tq"),
        scheduled_event_id: 3,
        schedule_to_start_timeout: None,
        directive,
        priority: None,
    })
}

pub fn close_task(task_id: i64, delete_after_close: bool) -> Task {
    Task::CloseExecution(CloseExecutionTask {
        key: key(),
        task_id,
        visibility_time: Utc::now(),
        version: None,
        delete_after_close,
    })
}

pub fn delete_task(task_id: i64, version: Option<i64>) -> Task {
    Task::DeleteExecution(DeleteExecutionTask {
        key: key(),
        task_id,
        visibility_time: Utc::now(),
        version,
        process_stage: DeleteStage::None,
    })
}

pub fn test_shard() -> Arc<ShardContext> {
    Arc::new(ShardContext::new(1, Arc::new(HistoryConfig::default())))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpdate {
    pub key: WorkflowKey,
    pub policy: TransactionPolicy,
    pub expected_db_record_version: i64,
    pub mutations: Vec<MutableStateMutation>,
}

/// Mutable state store backed by a map.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<WorkflowKey, MutableState>>,
    updates: Mutex<Vec<RecordedUpdate>>,
    loads: AtomicUsize,
    load_error: Option<ErrorFn>,
    load_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_state(state: MutableState) -> Self {
        let store = Self::default();
        store.put(state);
        store
    }

    pub fn failing_loads_with<F>(mut self, error: F) -> Self
    where
        F: Fn() -> HistoryError + Send + Sync + 'static,
    {
        self.load_error = Some(Box::new(error));
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn put(&self, state: MutableState) {
        self.states.lock().unwrap().insert(state.key.clone(), state);
    }

    pub fn state(&self, key: &WorkflowKey) -> Option<MutableState> {
        self.states.lock().unwrap().get(key).cloned()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl MutableStateStore for MemoryStore {
    async fn get_mutable_state(&self, key: &WorkflowKey) -> HistoryResult<MutableState> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.load_error {
            return Err(error());
        }
        self.state(key)
            .ok_or_else(|| HistoryError::NotFound(format!("workflow {}", key)))
    }

    async fn update_mutable_state(
        &self,
        key: &WorkflowKey,
        policy: TransactionPolicy,
        expected_db_record_version: i64,
        mutations: Vec<MutableStateMutation>,
    ) -> HistoryResult<i64> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .get_mut(key)
            .ok_or_else(|| HistoryError::NotFound(format!("workflow {}", key)))?;
        if state.execution_info.db_record_version != expected_db_record_version {
            return Err(HistoryError::ConditionFailed(format!(
                "expected record version {}, found {}",
                expected_db_record_version, state.execution_info.db_record_version
            )));
        }
        for mutation in &mutations {
            state.apply(mutation)?;
        }
        state.execution_info.db_record_version += 1;
        self.updates.lock().unwrap().push(RecordedUpdate {
            key: key.clone(),
            policy,
            expected_db_record_version,
            mutations,
        });
        Ok(state.execution_info.db_record_version)
    }
}

/// Matching client recording every request it receives.
#[derive(Default)]
pub struct RecordingMatching {
    build_id: Option<String>,
    add_error: Option<ErrorFn>,
    activity_requests: Mutex<Vec<AddActivityTaskRequest>>,
    workflow_requests: Mutex<Vec<AddWorkflowTaskRequest>>,
    sync_versions: HashMap<String, i64>,
    sync_errors: HashMap<String, ErrorFn>,
    sync_delay: Option<Duration>,
    sync_requests: Mutex<Vec<SyncUserDataRequest>>,
    syncs_in_flight: AtomicUsize,
    max_syncs_in_flight: AtomicUsize,
    propagation_error: Option<ErrorFn>,
    propagation_requests: Mutex<Vec<CheckUserDataPropagationRequest>>,
}

impl RecordingMatching {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build_id(mut self, build_id: &str) -> Self {
        self.build_id = Some(build_id.to_string());
        self
    }

    /// Fail every add call with `error`.
    pub fn failing_with<F>(mut self, error: F) -> Self
    where
        F: Fn() -> HistoryError + Send + Sync + 'static,
    {
        self.add_error = Some(Box::new(error));
        self
    }

    pub fn with_sync_version(mut self, task_queue: &str, version: i64) -> Self {
        self.sync_versions.insert(task_queue.to_string(), version);
        self
    }

    pub fn failing_sync_for<F>(mut self, task_queue: &str, error: F) -> Self
    where
        F: Fn() -> HistoryError + Send + Sync + 'static,
    {
        self.sync_errors.insert(task_queue.to_string(), Box::new(error));
        self
    }

    pub fn with_sync_delay(mut self, delay: Duration) -> Self {
        self.sync_delay = Some(delay);
        self
    }

    pub fn failing_propagation_with<F>(mut self, error: F) -> Self
    where
        F: Fn() -> HistoryError + Send + Sync + 'static,
    {
        self.propagation_error = Some(Box::new(error));
        self
    }

    pub fn activity_requests(&self) -> Vec<AddActivityTaskRequest> {
        self.activity_requests.lock().unwrap().clone()
    }

    pub fn workflow_requests(&self) -> Vec<AddWorkflowTaskRequest> {
        self.workflow_requests.lock().unwrap().clone()
    }

    pub fn sync_requests(&self) -> Vec<SyncUserDataRequest> {
        self.sync_requests.lock().unwrap().clone()
    }

    pub fn propagation_requests(&self) -> Vec<CheckUserDataPropagationRequest> {
        self.propagation_requests.lock().unwrap().clone()
    }

    pub fn max_syncs_in_flight(&self) -> usize {
        self.max_syncs_in_flight.load(Ordering::SeqCst)
    }

    fn add_response(&self) -> HistoryResult<AddTaskResponse> {
        if let Some(error) = &self.add_error {
            return Err(error());
        }
        Ok(AddTaskResponse {
            assigned_build_id: self.build_id.clone(),
        })
    }
}

#[async_trait]
impl MatchingClient for RecordingMatching {
    async fn add_activity_task(
        &self,
        request: AddActivityTaskRequest,
    ) -> HistoryResult<AddTaskResponse> {
        self.activity_requests.lock().unwrap().push(request);
        self.add_response()
    }

    async fn add_workflow_task(
        &self,
        request: AddWorkflowTaskRequest,
    ) -> HistoryResult<AddTaskResponse> {
        self.workflow_requests.lock().unwrap().push(request);
        self.add_response()
    }

    async fn sync_deployment_user_data(
        &self,
        request: SyncUserDataRequest,
    ) -> HistoryResult<SyncUserDataResponse> {
        let task_queue = request.task_queue.clone();
        self.sync_requests.lock().unwrap().push(request);

        let in_flight = self.syncs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_syncs_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.sync_delay {
            tokio::time::sleep(delay).await;
        }
        self.syncs_in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.sync_errors.get(&task_queue) {
            return Err(error());
        }
        Ok(SyncUserDataResponse {
            version: self.sync_versions.get(&task_queue).copied().unwrap_or(1),
        })
    }

    async fn check_user_data_propagation(
        &self,
        request: CheckUserDataPropagationRequest,
    ) -> HistoryResult<()> {
        self.propagation_requests.lock().unwrap().push(request);
        match &self.propagation_error {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }
}

const DELETE_STAGES: [DeleteStage; 4] = [
    DeleteStage::Visibility,
    DeleteStage::Current,
    DeleteStage::MutableState,
    DeleteStage::History,
];

/// Delete manager walking the stages and recording where each call started.
#[derive(Default)]
pub struct RecordingDeleteManager {
    fail_at: Mutex<Option<DeleteStage>>,
    delay: Option<Duration>,
    starting_stages: Mutex<Vec<DeleteStage>>,
}

impl RecordingDeleteManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(self, stage: DeleteStage) -> Self {
        *self.fail_at.lock().unwrap() = Some(stage);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn clear_failure(&self) {
        *self.fail_at.lock().unwrap() = None;
    }

    pub fn call_count(&self) -> usize {
        self.starting_stages.lock().unwrap().len()
    }

    pub fn starting_stages(&self) -> Vec<DeleteStage> {
        self.starting_stages.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeleteManager for RecordingDeleteManager {
    async fn delete_workflow_execution(
        &self,
        _namespace_id: &str,
        _key: &WorkflowKey,
        _lease: &WorkflowLease,
        _state: &MutableState,
        stage: &mut DeleteStage,
    ) -> HistoryResult<()> {
        self.starting_stages.lock().unwrap().push(*stage);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let fail_at = *self.fail_at.lock().unwrap();
        for step in DELETE_STAGES {
            if stage.is_processed(step) {
                continue;
            }
            if fail_at == Some(step) {
                return Err(HistoryError::Unavailable(format!(
                    "deleting {:?} failed",
                    step
                )));
            }
            stage.advance_to(step);
        }
        Ok(())
    }
}
