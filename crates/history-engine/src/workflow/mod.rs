//! Per-workflow state access.
//!
//! - **Lock**: priority-aware exclusive lock
//! - **Cache**: shard-scoped contexts and leases
//! - **Mutable state**: snapshot types, store boundary and read path

pub mod cache;
pub mod lock;
pub mod mutable_state;

pub use cache::{CacheStats, WorkflowCache, WorkflowContext, WorkflowLease};
pub use lock::{LockPriority, PriorityLock};
pub use mutable_state::{
    load_mutable_state_for_task, ActivityInfo, ExecutionInfo, ExecutionKind, MutableState,
    MutableStateMutation, MutableStateStore, TransactionPolicy, WorkflowStatus, WorkflowTaskInfo,
};
