//! Shard-scoped cache of workflow execution contexts.
//!
//! A [`WorkflowLease`] is the exclusive handle on one workflow. It must be
//! released with the outcome of the operation that held it; a failed
//! operation evicts the cached mutable state so the next holder reloads it.
//! Dropping a lease without releasing it (early return, panic) releases it
//! as failed.
//!
//! A context leaves the cache as soon as nobody holds or waits for it and it
//! caches no state. Contexts that do cache state are bounded by the cache
//! capacity; the least recently locked idle one is evicted first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::lock::{LockPriority, PriorityLock};
use super::mutable_state::{ExecutionKind, MutableState};
use crate::error::{HistoryError, HistoryResult};
use crate::tasks::WorkflowKey;

/// In-memory handle to one workflow execution.
#[derive(Debug)]
pub struct WorkflowContext {
    key: WorkflowKey,
    lock: PriorityLock,
    mutable_state: Mutex<Option<MutableState>>,
    last_locked: AtomicU64,
}

impl WorkflowContext {
    fn new(key: WorkflowKey) -> Self {
        Self {
            key,
            lock: PriorityLock::new(),
            mutable_state: Mutex::new(None),
            last_locked: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    pub fn cached_state(&self) -> Option<MutableState> {
        self.mutable_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn has_cached_state(&self) -> bool {
        self.mutable_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn set_cached_state(&self, state: MutableState) {
        *self.mutable_state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    /// Drop the cached mutable state.
    pub fn clear(&self) {
        *self.mutable_state.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub acquired: u64,
    pub released: u64,
    pub evicted: u64,
    /// Error reported by the most recent failed release.
    pub last_release_error: Option<String>,
}

/// Capacity used by [`WorkflowCache::new`].
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct CacheInner {
    contexts: Mutex<HashMap<WorkflowKey, Arc<WorkflowContext>>>,
    capacity: usize,
    lock_clock: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    evicted: AtomicU64,
    last_release_error: Mutex<Option<String>>,
}

impl CacheInner {
    fn contexts(&self) -> std::sync::MutexGuard<'_, HashMap<WorkflowKey, Arc<WorkflowContext>>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop `context` from the map if the releasing lease holds the only
    /// other reference to it.
    fn forget_if_idle(&self, context: &Arc<WorkflowContext>) {
        let mut contexts = self.contexts();
        let idle = contexts
            .get(context.key())
            .is_some_and(|cached| Arc::ptr_eq(cached, context))
            && Arc::strong_count(context) == 2
            && !context.is_locked()
            && !context.has_cached_state();
        if idle {
            contexts.remove(context.key());
        }
    }
}

/// Workflow contexts of one shard.
#[derive(Debug, Clone)]
pub struct WorkflowCache {
    inner: Arc<CacheInner>,
}

impl Default for WorkflowCache {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Cache holding at most `capacity` idle contexts. Contexts in use are
    /// never evicted, so the cache may exceed it while they are.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                contexts: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                lock_clock: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                last_release_error: Mutex::new(None),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn context(&self, key: &WorkflowKey) -> Arc<WorkflowContext> {
        let mut contexts = self.inner.contexts();
        if let Some(context) = contexts.get(key) {
            return context.clone();
        }

        if contexts.len() >= self.inner.capacity {
            // only the map references an idle context
            let lru = contexts
                .values()
                .filter(|c| Arc::strong_count(c) == 1 && !c.is_locked())
                .min_by_key(|c| c.last_locked.load(Ordering::Relaxed))
                .map(|c| c.key().clone());
            if let Some(lru) = lru {
                debug!(workflow = %lru, "Evicting least recently used workflow context");
                contexts.remove(&lru);
            }
        }

        let context = Arc::new(WorkflowContext::new(key.clone()));
        contexts.insert(key.clone(), context.clone());
        context
    }

    /// Get or create the context of `key` and lock it at `priority`.
    ///
    /// Returns [`HistoryError::Cancelled`] if `cancel` fires while waiting.
    pub async fn get_or_create(
        &self,
        key: &WorkflowKey,
        kind: ExecutionKind,
        priority: LockPriority,
        cancel: &CancellationToken,
    ) -> HistoryResult<WorkflowLease> {
        let context = self.context(key);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HistoryError::Cancelled),
            _ = context.lock.lock(priority) => {}
        }

        let tick = self.inner.lock_clock.fetch_add(1, Ordering::Relaxed);
        context.last_locked.store(tick, Ordering::Relaxed);
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(workflow = %key, ?priority, ?kind, "Workflow lock acquired");

        Ok(WorkflowLease {
            context,
            cache: self.inner.clone(),
            kind,
            released: false,
        })
    }

    pub fn is_locked(&self, key: &WorkflowKey) -> bool {
        let contexts = self.inner.contexts();
        contexts.get(key).map(|c| c.is_locked()).unwrap_or(false)
    }

    /// Whether mutable state of `key` is currently cached.
    pub fn is_cached(&self, key: &WorkflowKey) -> bool {
        let contexts = self.inner.contexts();
        contexts
            .get(key)
            .map(|c| c.has_cached_state())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every context that is not currently locked. Called when the
    /// shard is torn down.
    pub fn purge(&self) {
        self.inner
            .contexts()
            .retain(|_, context| context.is_locked());
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
            last_release_error: self
                .inner
                .last_release_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// Exclusive hold on one workflow context.
#[derive(Debug)]
pub struct WorkflowLease {
    context: Arc<WorkflowContext>,
    cache: Arc<CacheInner>,
    kind: ExecutionKind,
    released: bool,
}

impl WorkflowLease {
    pub fn key(&self) -> &WorkflowKey {
        self.context.key()
    }

    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    /// Release the lock, reporting the outcome of the operation.
    pub fn release(mut self, outcome: Result<(), &HistoryError>) {
        self.release_inner(outcome.err().map(|e| e.to_string()));
    }

    fn release_inner(&mut self, error: Option<String>) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(error) = error {
            self.context.clear();
            self.cache.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(workflow = %self.key(), error = %error, "Evicted cached mutable state");
            *self
                .cache
                .last_release_error
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(error);
        }

        self.context.lock.unlock();
        self.cache.released.fetch_add(1, Ordering::Relaxed);
        self.cache.forget_if_idle(&self.context);
    }
}

impl Drop for WorkflowLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(workflow = %self.key(), "Workflow lease dropped without release");
            self.release_inner(Some("lease dropped without release".to_string()));
        }
    }
}
