//! Vector clocks identifying one queued task instance across shards and
//! clusters.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, HistoryResult};

/// `(cluster id, shard id, task id)` reference to a task.
///
/// Task ids are strictly increasing within a `(cluster_id, shard_id)` pair,
/// so two clocks are only comparable when they share that pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    pub cluster_id: i64,
    pub shard_id: i32,
    pub clock: i64,
}

impl VectorClock {
    pub fn new(cluster_id: i64, shard_id: i32, clock: i64) -> Self {
        Self {
            cluster_id,
            shard_id,
            clock,
        }
    }

    /// Whether both clocks were issued by the same shard of the same cluster.
    pub fn is_comparable(&self, other: &VectorClock) -> bool {
        self.cluster_id == other.cluster_id && self.shard_id == other.shard_id
    }

    /// Causal comparison. Clocks from different shards or clusters carry no
    /// ordering information and yield an error.
    pub fn compare(&self, other: &VectorClock) -> HistoryResult<Ordering> {
        if !self.is_comparable(other) {
            return Err(HistoryError::InvalidState(format!(
                "incomparable vector clocks: cluster {} shard {} vs cluster {} shard {}",
                self.cluster_id, self.shard_id, other.cluster_id, other.shard_id
            )));
        }
        Ok(self.clock.cmp(&other.clock))
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.cluster_id, self.shard_id, self.clock)
    }
}
