//! Per-shard queue states and the ack check.
//!
//! The ack level of a category is exclusive: every task id strictly below it
//! has been processed. Tasks completed out of order above the ack level are
//! tracked as explicit exceptions until the ack level passes them.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::tasks::{Task, TaskCategory, WorkflowKey};

/// Ack state of one queue category of one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    ack_level: i64,
    acked_exceptions: BTreeSet<i64>,
}

impl QueueState {
    pub fn new(ack_level: i64) -> Self {
        Self {
            ack_level,
            acked_exceptions: BTreeSet::new(),
        }
    }

    pub fn ack_level(&self) -> i64 {
        self.ack_level
    }

    pub fn acked_exceptions(&self) -> impl Iterator<Item = &i64> {
        self.acked_exceptions.iter()
    }

    pub fn is_acked(&self, task_id: i64) -> bool {
        task_id < self.ack_level || self.acked_exceptions.contains(&task_id)
    }

    /// Record a completion. Exceptions contiguous with the ack level are
    /// folded into it.
    pub fn mark_acked(&mut self, task_id: i64) {
        if task_id >= self.ack_level {
            self.acked_exceptions.insert(task_id);
            self.fold_exceptions();
        }
    }

    fn fold_exceptions(&mut self) {
        while self.acked_exceptions.remove(&self.ack_level) {
            self.ack_level += 1;
        }
    }

    /// Move the ack level forward. Lower levels are ignored.
    ///
    /// Returns whether the level moved.
    pub fn advance_ack_level(&mut self, ack_level: i64) -> bool {
        if ack_level <= self.ack_level {
            return false;
        }
        self.ack_level = ack_level;
        self.acked_exceptions = self.acked_exceptions.split_off(&ack_level);
        self.fold_exceptions();
        true
    }
}

/// Reference to a task the caller no longer holds a handle to.
///
/// Only the identity matters for the ack check, no payload is carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub key: WorkflowKey,
    pub category: TaskCategory,
    pub task_id: i64,
}

impl TaskRef {
    pub fn close_execution(key: WorkflowKey, task_id: i64) -> Self {
        Self {
            key,
            category: TaskCategory::Transfer,
            task_id,
        }
    }
}

impl From<&Task> for TaskRef {
    fn from(task: &Task) -> Self {
        Self {
            key: task.key().clone(),
            category: task.category(),
            task_id: task.task_id(),
        }
    }
}

/// Whether `task` falls in the acked region of `state`.
pub fn is_task_acked(task: &TaskRef, state: &QueueState) -> bool {
    state.is_acked(task.task_id)
}

/// Queue states of one shard, keyed by category.
#[derive(Debug, Default)]
pub struct QueueStates {
    states: RwLock<HashMap<TaskCategory, QueueState>>,
}

impl QueueStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the state of `category`, `None` if the shard never
    /// recorded one.
    pub fn get(&self, category: TaskCategory) -> Option<QueueState> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states.get(&category).cloned()
    }

    pub fn set(&self, category: TaskCategory, state: QueueState) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states.insert(category, state);
    }

    /// Record completion of a task id in `category`.
    pub fn mark_acked(&self, category: TaskCategory, task_id: i64) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states.entry(category).or_default().mark_acked(task_id);
    }

    pub fn advance_ack_level(&self, category: TaskCategory, ack_level: i64) -> bool {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        let moved = states
            .entry(category)
            .or_default()
            .advance_ack_level(ack_level);
        if moved {
            tracing::debug!(category = %category, ack_level, "Queue ack level advanced");
        }
        moved
    }
}
