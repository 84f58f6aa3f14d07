//! Priority-aware exclusive lock.
//!
//! A free lock goes to a caller only if nobody of strictly higher priority is
//! queued for it, so deletion traffic (low) yields to live execution traffic
//! (normal/high) while still making progress whenever the lock is idle.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Acquisition priority of a workflow lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockPriority {
    Low,
    Normal,
    High,
}

impl LockPriority {
    fn index(self) -> usize {
        match self {
            LockPriority::Low => 0,
            LockPriority::Normal => 1,
            LockPriority::High => 2,
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    waiting: [usize; 3],
}

impl LockState {
    fn has_waiters_above(&self, priority: LockPriority) -> bool {
        self.waiting[priority.index() + 1..].iter().any(|n| *n > 0)
    }
}

/// Exclusive lock with three priority tiers.
///
/// The lock is not RAII: ownership is tracked by the caller, which must call
/// [`PriorityLock::unlock`] exactly once per successful acquisition.
#[derive(Debug, Default)]
pub struct PriorityLock {
    state: Mutex<LockState>,
    notify: Notify,
}

/// Queued-waiter registration, undone if the acquiring future is dropped.
struct Waiter<'a> {
    lock: &'a PriorityLock,
    priority: LockPriority,
    registered: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.registered {
            let mut state = self.lock.state();
            state.waiting[self.priority.index()] -= 1;
            drop(state);
            // a lower tier may have been waiting on us
            self.lock.notify.notify_waiters();
        }
    }
}

impl PriorityLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire without waiting.
    pub fn try_lock(&self, priority: LockPriority) -> bool {
        let mut state = self.state();
        if state.locked || state.has_waiters_above(priority) {
            return false;
        }
        state.locked = true;
        true
    }

    /// Wait until the lock is granted at `priority`. Cancel safe.
    pub async fn lock(&self, priority: LockPriority) {
        let mut waiter = Waiter {
            lock: self,
            priority,
            registered: false,
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if !state.locked && !state.has_waiters_above(priority) {
                    state.locked = true;
                    if waiter.registered {
                        state.waiting[priority.index()] -= 1;
                        waiter.registered = false;
                    }
                    return;
                }
                if !waiter.registered {
                    state.waiting[priority.index()] += 1;
                    waiter.registered = true;
                }
            }

            notified.await;
        }
    }

    pub fn unlock(&self) {
        let mut state = self.state();
        debug_assert!(state.locked, "unlock of an unlocked workflow lock");
        state.locked = false;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Number of callers queued at `priority`.
    pub fn waiting(&self, priority: LockPriority) -> usize {
        self.state().waiting[priority.index()]
    }
}
