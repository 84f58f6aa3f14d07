//! Error types for the history execution core.
//!
//! Every error carries a [`TaskDisposition`] telling the shard processing
//! loop what to do with the task that produced it.

use thiserror::Error;

/// What the caller should do with a task whose processing returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Transient failure, retry with the shard's backoff.
    Retry,
    /// A dependent task has not been observed as acked yet. Retry after the
    /// ack level had a chance to propagate.
    RetryAfterAckPropagation,
    /// The task is stale or its target is gone. Never retry.
    Drop,
    /// The task itself is broken. Log, surface and give up on it.
    Fatal,
}

/// Errors produced by the history execution core.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Entity not found (workflow, task queue, ...)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Downstream service unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Deadline exceeded
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Shard context cancelled (ownership lost or shutting down)
    #[error("Operation cancelled: shard context is no longer valid")]
    Cancelled,

    /// Close execution task of the workflow is not acked yet
    #[error("Dependency task not completed")]
    DependencyTaskNotCompleted,

    /// Task version does not match the authoritative version
    #[error("Version conflict: task version {task_version}, current version {current_version}")]
    VersionConflict {
        task_version: i64,
        current_version: i64,
    },

    /// Mutable state is behind what the task refers to
    #[error("Stale mutable state: {0}")]
    StaleState(String),

    /// Conditional update lost a race
    #[error("Condition failed: {0}")]
    ConditionFailed(String),

    /// Mutable state is not in a state the operation expects
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Task payload could not be decoded
    #[error("Malformed task: {0}")]
    MalformedTask(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HistoryError {
    /// Classify the error for the processing loop.
    pub fn disposition(&self) -> TaskDisposition {
        match self {
            HistoryError::Unavailable(_)
            | HistoryError::Timeout(_)
            | HistoryError::Cancelled
            | HistoryError::StaleState(_)
            | HistoryError::ConditionFailed(_)
            | HistoryError::Internal(_) => TaskDisposition::Retry,
            HistoryError::DependencyTaskNotCompleted => TaskDisposition::RetryAfterAckPropagation,
            HistoryError::VersionConflict { .. } | HistoryError::NotFound(_) => {
                TaskDisposition::Drop
            }
            HistoryError::InvalidState(_)
            | HistoryError::MalformedTask(_)
            | HistoryError::Config(_) => TaskDisposition::Fatal,
        }
    }

    /// Whether retrying the task may eventually succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.disposition(),
            TaskDisposition::Retry | TaskDisposition::RetryAfterAckPropagation
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HistoryError::NotFound(_))
    }
}

/// Result type alias using HistoryError.
pub type HistoryResult<T> = Result<T, HistoryError>;

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        HistoryError::MalformedTask(err.to_string())
    }
}

impl From<anyhow::Error> for HistoryError {
    fn from(err: anyhow::Error) -> Self {
        HistoryError::Internal(err.to_string())
    }
}

impl From<envy::Error> for HistoryError {
    fn from(err: envy::Error) -> Self {
        HistoryError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for HistoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HistoryError::Timeout(err.to_string())
        } else if err.is_decode() {
            HistoryError::Internal(err.to_string())
        } else {
            HistoryError::Unavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_display() {
        let err = HistoryError::VersionConflict {
            task_version: 3,
            current_version: 5,
        };
        assert_eq!(
            err.to_string(),
            "Version conflict: task version 3, current version 5"
        );
    }

    #[test]
    fn test_dependency_is_distinct_from_transient() {
        let dep = HistoryError::DependencyTaskNotCompleted;
        let transient = HistoryError::Unavailable("matching down".to_string());
        assert_eq!(dep.disposition(), TaskDisposition::RetryAfterAckPropagation);
        assert_eq!(transient.disposition(), TaskDisposition::Retry);
        assert!(dep.is_retryable());
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_version_conflict_is_never_retried() {
        let err = HistoryError::VersionConflict {
            task_version: 1,
            current_version: 2,
        };
        assert_eq!(err.disposition(), TaskDisposition::Drop);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_malformed_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: HistoryError = json_err.into();
        assert!(matches!(err, HistoryError::MalformedTask(_)));
        assert_eq!(err.disposition(), TaskDisposition::Fatal);
    }
}
