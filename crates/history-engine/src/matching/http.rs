//! Matching service HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};

use super::{
    AddActivityTaskRequest, AddTaskResponse, AddWorkflowTaskRequest,
    CheckUserDataPropagationRequest, MatchingClient, SyncUserDataRequest, SyncUserDataResponse,
};
use crate::config::HistoryConfig;
use crate::error::{HistoryError, HistoryResult};

/// JSON-over-HTTP client for the matching service.
#[derive(Clone)]
pub struct HttpMatchingClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMatchingClient {
    /// Create a new client. `timeout` bounds every request, callers apply
    /// their own tighter deadlines on top.
    pub fn new(base_url: &str, timeout: Duration) -> HistoryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HistoryError::Config(format!("matching client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Client for `HISTORY_MATCHING_URL`, bounded by the operation timeout.
    pub fn from_config(config: &HistoryConfig) -> HistoryResult<Self> {
        let base_url = config
            .matching_url
            .as_deref()
            .ok_or_else(|| HistoryError::Config("HISTORY_MATCHING_URL is not set".to_string()))?;
        Self::new(base_url, config.op_timeout())
    }

    /// Post `request` and fail on a non-success status. The body is left
    /// unread.
    async fn send<Req>(&self, path: &str, request: &Req) -> HistoryResult<reqwest::Response>
    where
        Req: Serialize + Sync,
    {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        Ok(response)
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req) -> HistoryResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        Ok(self.send(path, request).await?.json().await?)
    }
}

/// Maps a non-success response to the error taxonomy.
fn classify_status(status: StatusCode, body: String) -> HistoryError {
    match status {
        StatusCode::NOT_FOUND => HistoryError::NotFound(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => HistoryError::Timeout(body),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            HistoryError::ConditionFailed(body)
        }
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE => HistoryError::Unavailable(body),
        StatusCode::BAD_REQUEST => HistoryError::InvalidState(body),
        status => HistoryError::Internal(format!("Status {}: {}", status, body)),
    }
}

#[async_trait]
impl MatchingClient for HttpMatchingClient {
    async fn add_activity_task(
        &self,
        request: AddActivityTaskRequest,
    ) -> HistoryResult<AddTaskResponse> {
        self.post("/api/matching/activity-tasks", &request).await
    }

    async fn add_workflow_task(
        &self,
        request: AddWorkflowTaskRequest,
    ) -> HistoryResult<AddTaskResponse> {
        self.post("/api/matching/workflow-tasks", &request).await
    }

    async fn sync_deployment_user_data(
        &self,
        request: SyncUserDataRequest,
    ) -> HistoryResult<SyncUserDataResponse> {
        self.post("/api/matching/user-data/sync", &request).await
    }

    async fn check_user_data_propagation(
        &self,
        request: CheckUserDataPropagationRequest,
    ) -> HistoryResult<()> {
        // success carries no payload
        self.send("/api/matching/user-data/propagation", &request)
            .await?;
        Ok(())
    }
}
