//! History engine configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::HistoryResult;

/// Configuration loaded from environment variables.
///
/// Environment variables are prefixed with `HISTORY_`:
/// - `HISTORY_CLUSTER_ID`: Numeric id of this cluster (default: 1)
/// - `HISTORY_CLUSTER_NAME`: Name of this cluster (default: "active")
/// - `HISTORY_TASK_TIMEOUT_SECS`: Deadline of one deletion (default: 10)
/// - `HISTORY_TIMEOUT_MULTIPLIER`: Scales task timeouts for slow environments (default: 1)
/// - `HISTORY_OP_TIMEOUT_SECS`: Deadline of one dispatch or mutable state call (default: 20)
/// - `HISTORY_ACK_PROPAGATION_DELAY_SECS`: Retry delay for tasks waiting on ack levels (default: 30)
/// - `HISTORY_RETRY_BACKOFF_MS` / `HISTORY_RETRY_MAX_BACKOFF_MS`: Transient retry backoff (default: 500 / 10000)
/// - `HISTORY_MAX_CONCURRENT_TASKS`: Tasks processed concurrently per shard (default: 16)
/// - `HISTORY_MAX_CONCURRENT_SYNCS`: In-flight user data syncs (default: 8)
/// - `HISTORY_WORKFLOW_CACHE_SIZE`: Idle workflow contexts kept per shard (default: 1024)
/// - `HISTORY_MATCHING_URL`: Matching service base URL (optional)
/// - `HISTORY_LOG_JSON`: Emit logs as JSON (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_cluster_id")]
    pub cluster_id: i64,

    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: u32,

    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,

    #[serde(default = "default_ack_propagation_delay_secs")]
    pub ack_propagation_delay_secs: u64,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,

    #[serde(default = "default_workflow_cache_size")]
    pub workflow_cache_size: usize,

    #[serde(default)]
    pub matching_url: Option<String>,

    #[serde(default)]
    pub log_json: bool,
}

fn default_cluster_id() -> i64 {
    1
}

fn default_cluster_name() -> String {
    "active".to_string()
}

fn default_task_timeout_secs() -> u64 {
    10
}

fn default_timeout_multiplier() -> u32 {
    1
}

fn default_op_timeout_secs() -> u64 {
    20
}

fn default_ack_propagation_delay_secs() -> u64 {
    30
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_retry_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_concurrent_tasks() -> usize {
    16
}

fn default_max_concurrent_syncs() -> usize {
    8
}

fn default_workflow_cache_size() -> usize {
    1024
}

impl HistoryConfig {
    /// Load configuration from environment variables, reading `.env` first
    /// if present.
    pub fn from_env() -> HistoryResult<Self> {
        dotenvy::dotenv().ok();
        let config = envy::prefixed("HISTORY_").from_env::<HistoryConfig>()?;
        Ok(config)
    }

    /// Deadline of one deletion, scaled by the timeout multiplier.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs) * self.timeout_multiplier.max(1)
    }

    /// Deadline of one dispatch or mutable state call.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn ack_propagation_delay(&self) -> Duration {
        Duration::from_secs(self.ack_propagation_delay_secs)
    }

    /// Backoff before retry number `attempt` (1-based) of a transient failure.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.retry_max_backoff_ms))
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            cluster_name: default_cluster_name(),
            task_timeout_secs: default_task_timeout_secs(),
            timeout_multiplier: default_timeout_multiplier(),
            op_timeout_secs: default_op_timeout_secs(),
            ack_propagation_delay_secs: default_ack_propagation_delay_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_concurrent_syncs: default_max_concurrent_syncs(),
            workflow_cache_size: default_workflow_cache_size(),
            matching_url: None,
            log_json: false,
        }
    }
}
