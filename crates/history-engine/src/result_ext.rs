//! Result extension trait for logging task errors with context.
//!
//! The log level follows the error's [`TaskDisposition`]: tasks that are
//! about to be dropped are logged quietly, retries are warnings and fatal
//! errors are errors.

use tracing::{debug, error, warn};

use crate::error::{HistoryError, TaskDisposition};
use crate::tasks::Task;

/// Extension trait for logging history errors with context.
pub trait ResultExt<T> {
    /// Log the error with context if this is an `Err` variant.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use history_engine::result_ext::ResultExt;
    ///
    /// let result = store.load(&key).await.log("loading mutable state");
    /// ```
    fn log<S: ToString>(self, context: S) -> Self;

    /// Log the error together with the identity of the task being processed.
    fn log_task(self, task: &Task) -> Self;
}

impl<T> ResultExt<T> for Result<T, HistoryError> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Self {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            let file = format!("{}:{}", caller_location.file(), caller_location.line());
            let context = context.to_string();
            match e.disposition() {
                TaskDisposition::Drop => {
                    debug!(target: "history_engine", error = %e, file = %file, context = %context, "Operation dropped")
                }
                TaskDisposition::Retry | TaskDisposition::RetryAfterAckPropagation => {
                    warn!(target: "history_engine", error = %e, file = %file, context = %context, "Operation will be retried")
                }
                TaskDisposition::Fatal => {
                    error!(target: "history_engine", error = %e, file = %file, context = %context, "Operation failed")
                }
            }
        }
        self
    }

    fn log_task(self, task: &Task) -> Self {
        if let Err(ref e) = self {
            let key = task.key();
            let level = e.disposition();
            if level == TaskDisposition::Fatal {
                error!(
                    target: "history_engine",
                    error = %e,
                    namespace_id = %key.namespace_id,
                    workflow_id = %key.workflow_id,
                    run_id = %key.run_id,
                    task_id = task.task_id(),
                    task_type = %task.type_name(),
                    "Task processing failed"
                );
            } else {
                warn!(
                    target: "history_engine",
                    error = %e,
                    disposition = ?level,
                    namespace_id = %key.namespace_id,
                    workflow_id = %key.workflow_id,
                    run_id = %key.run_id,
                    task_id = task.task_id(),
                    task_type = %task.type_name(),
                    "Task processing returned error"
                );
            }
        }
        self
    }
}
