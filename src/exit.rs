//! One-shot exit status publication.
//!
//! Every launched process owns one [`ExitLatch`]. The backend's watcher
//! thread completes it exactly once; any number of threads can block on it.
//! Signal delivery also goes through the latch so that a signal is never
//! sent to a pid after the watcher has reaped it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::status::ExitStatus;

#[derive(Debug)]
pub struct ExitLatch {
    status: Mutex<ExitStatus>,
    exited: Condvar,
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitLatch {
    pub fn new() -> Self {
        ExitLatch {
            status: Mutex::new(ExitStatus::NotExited),
            exited: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExitStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status without blocking.
    pub fn status(&self) -> ExitStatus {
        *self.lock()
    }

    pub fn is_exited(&self) -> bool {
        self.lock().is_terminal()
    }

    /// Publishes `status` and wakes every waiter.
    ///
    /// Returns `false` (and changes nothing) if a status was already
    /// published or `status` is `NotExited`.
    pub fn publish(&self, status: ExitStatus) -> bool {
        self.complete_with(|| status)
    }

    /// Runs `reap` and publishes its result while holding the latch.
    ///
    /// Used by watchers that must release the OS process (reap the zombie,
    /// close the handle) atomically with respect to [`ExitLatch::while_running`].
    pub fn complete_with(&self, reap: impl FnOnce() -> ExitStatus) -> bool {
        let mut guard = self.lock();
        if guard.is_terminal() {
            return false;
        }
        let status = reap();
        if !status.is_terminal() {
            return false;
        }
        *guard = status;
        drop(guard);
        self.exited.notify_all();
        true
    }

    /// Runs `f` only if no exit status has been published yet.
    ///
    /// The latch stays locked for the duration of `f`, so the watcher
    /// cannot reap the process underneath it.
    pub fn while_running<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let guard = self.lock();
        if guard.is_terminal() {
            return None;
        }
        let result = f();
        drop(guard);
        Some(result)
    }

    /// Blocks until a terminal status is published.
    pub fn wait(&self) -> ExitStatus {
        let mut guard = self.lock();
        while !guard.is_terminal() {
            guard = self
                .exited
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *guard
    }

    /// Blocks until a terminal status is published or `timeout` elapses.
    ///
    /// Returns `None` on timeout; the watcher keeps running regardless.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock();
        while !guard.is_terminal() {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return None;
            }
            guard = self
                .exited
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(*guard)
    }
}
