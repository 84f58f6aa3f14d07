//! Task version checks against mutable state.

use tracing::debug;

use crate::error::{HistoryError, HistoryResult};
use crate::namespace::NamespaceEntry;

/// Version value persisted for tasks that must not be version checked.
pub const EMPTY_VERSION: i64 = 0;

/// Normalizes a task version: both `None` and [`EMPTY_VERSION`] mean
/// "don't check".
pub fn effective_version(task_version: Option<i64>) -> Option<i64> {
    task_version.filter(|v| *v != EMPTY_VERSION)
}

/// Checks a task version against the authoritative version of the workflow.
///
/// Tasks without a version always pass. Otherwise the versions must match
/// exactly; a mismatch means the task is stale and must be dropped.
pub fn check_task_version(current_version: i64, task_version: Option<i64>) -> HistoryResult<()> {
    let Some(task_version) = effective_version(task_version) else {
        return Ok(());
    };
    if task_version != current_version {
        return Err(HistoryError::VersionConflict {
            task_version,
            current_version,
        });
    }
    Ok(())
}

/// Same as [`check_task_version`], skipping namespaces that are not
/// replicated across clusters.
pub fn check_task_version_for_namespace(
    namespace: &NamespaceEntry,
    current_version: i64,
    task_version: Option<i64>,
) -> HistoryResult<()> {
    if !namespace.is_global {
        return Ok(());
    }
    check_task_version(current_version, task_version).inspect_err(|e| {
        debug!(
            namespace = %namespace.name,
            error = %e,
            "Task version mismatch, task is stale"
        );
    })
}
