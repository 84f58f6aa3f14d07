//! History Engine
//!
//! Execution core of one shard of the history service.
//!
//! This crate provides:
//! - Task dispatch to matching, writing assigned build ids back to mutable state
//! - Task version checks against the failover version of a workflow
//! - Queue ack tracking for out-of-order task completion
//! - A priority-aware workflow lock and shard-scoped mutable state cache
//! - Staged deletion of closed workflows, guarded on their close task
//! - A bounded per-shard processing loop and deployment user data sync

pub mod config;
pub mod deletion;
pub mod deployment;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod matching;
pub mod namespace;
pub mod processor;
pub mod queues;
pub mod result_ext;
pub mod shard;
pub mod tasks;
pub mod telemetry;
pub mod vclock;
pub mod version;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use config::HistoryConfig;
pub use error::{HistoryError, HistoryResult, TaskDisposition};
pub use result_ext::ResultExt;
pub use shard::ShardContext;
pub use tasks::Task;
