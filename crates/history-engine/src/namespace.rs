//! Namespace lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, HistoryResult};

/// Namespace configuration referenced by mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub id: String,
    pub name: String,
    /// Replicated across clusters; only global namespaces are version checked.
    pub is_global: bool,
    /// Cluster currently owning writes for the namespace.
    pub active_cluster: String,
}

impl NamespaceEntry {
    pub fn is_active_in(&self, cluster_name: &str) -> bool {
        self.active_cluster == cluster_name
    }
}

/// Resolves namespace ids. Lookups are local and must not block on I/O.
pub trait NamespaceRegistry: Send + Sync {
    /// [`HistoryError::NotFound`] when the namespace does not exist.
    fn get_namespace_by_id(&self, id: &str) -> HistoryResult<NamespaceEntry>;
}

/// Registry holding a fixed set of namespaces, refreshed by the host.
#[derive(Debug, Default)]
pub struct StaticNamespaceRegistry {
    entries: RwLock<HashMap<String, NamespaceEntry>>,
}

impl StaticNamespaceRegistry {
    pub fn new(entries: impl IntoIterator<Item = NamespaceEntry>) -> Self {
        let registry = Self::default();
        for entry in entries {
            registry.upsert(entry);
        }
        registry
    }

    /// Insert or replace an entry, e.g. after a failover changed the
    /// active cluster.
    pub fn upsert(&self, entry: NamespaceEntry) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.id.clone(), entry);
    }
}

impl NamespaceRegistry for StaticNamespaceRegistry {
    fn get_namespace_by_id(&self, id: &str) -> HistoryResult<NamespaceEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(format!("namespace {}", id)))
    }
}
