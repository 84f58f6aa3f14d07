//! Worker deployment routing sync.
//!
//! Pushes deployment version data to the user data of every task queue of a
//! version and waits until matching propagated it. Calls fan out one per task
//! queue, bounded by `max_concurrent_syncs`; the first failure wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{error, info};

use crate::error::{HistoryError, HistoryResult};
use crate::matching::{
    CheckUserDataPropagationRequest, DeploymentVersionData, MatchingClient, SyncUserDataRequest,
    TaskQueueType, UserDataOperation,
};

/// User data change for one task queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskQueueSync {
    pub name: String,
    pub types: Vec<TaskQueueType>,
    pub operation: UserDataOperation,
}

impl TaskQueueSync {
    pub fn update(name: impl Into<String>, types: Vec<TaskQueueType>, data: DeploymentVersionData) -> Self {
        Self {
            name: name.into(),
            types,
            operation: UserDataOperation::UpdateVersionData { data },
        }
    }
}

/// Run `calls` with at most `limit` in flight, pairing every result with
/// its key. Results come back in completion order.
pub async fn fan_out<K, T, Fut>(calls: Vec<(K, Fut)>, limit: usize) -> Vec<(K, HistoryResult<T>)>
where
    Fut: Future<Output = HistoryResult<T>>,
{
    stream::iter(
        calls
            .into_iter()
            .map(|(key, call)| async move { (key, call.await) }),
    )
    .buffer_unordered(limit.max(1))
    .collect()
    .await
}

#[derive(Clone)]
pub struct DeploymentSyncer {
    matching: Arc<dyn MatchingClient>,
    max_concurrent_syncs: usize,
}

impl DeploymentSyncer {
    pub fn new(matching: Arc<dyn MatchingClient>, max_concurrent_syncs: usize) -> Self {
        Self {
            matching,
            max_concurrent_syncs,
        }
    }

    /// Apply every sync and return the highest user data version matching
    /// reported per task queue name.
    pub async fn sync_deployment_user_data(
        &self,
        namespace_id: &str,
        syncs: Vec<TaskQueueSync>,
    ) -> HistoryResult<HashMap<String, i64>> {
        let calls = syncs
            .into_iter()
            .map(|sync| {
                info!(task_queue = %sync.name, types = ?sync.types, "Syncing task queue user data");
                let request = SyncUserDataRequest {
                    namespace_id: namespace_id.to_string(),
                    task_queue: sync.name.clone(),
                    task_queue_types: sync.types,
                    operation: sync.operation,
                };
                (sync.name, self.matching.sync_deployment_user_data(request))
            })
            .collect();

        let mut max_versions: HashMap<String, i64> = HashMap::new();
        let mut first_error: Option<HistoryError> = None;
        for (task_queue, result) in fan_out(calls, self.max_concurrent_syncs).await {
            match result {
                Ok(response) => {
                    let version = max_versions.entry(task_queue).or_insert(response.version);
                    *version = (*version).max(response.version);
                }
                Err(e) => {
                    error!(task_queue = %task_queue, error = %e, "Syncing task queue user data failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(max_versions),
        }
    }

    /// Wait until each task queue's user data reached at least the given
    /// version on all partitions.
    pub async fn check_user_data_propagation(
        &self,
        namespace_id: &str,
        max_versions: &HashMap<String, i64>,
    ) -> HistoryResult<()> {
        let calls = max_versions
            .iter()
            .map(|(task_queue, version)| {
                info!(task_queue = %task_queue, version, "Waiting for user data propagation");
                let request = CheckUserDataPropagationRequest {
                    namespace_id: namespace_id.to_string(),
                    task_queue: task_queue.clone(),
                    version: *version,
                };
                (task_queue.clone(), self.matching.check_user_data_propagation(request))
            })
            .collect();

        let mut first_error = None;
        for (task_queue, result) in fan_out(calls, self.max_concurrent_syncs).await {
            if let Err(e) = result {
                error!(task_queue = %task_queue, error = %e, "User data propagation check failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
