// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mutex paired with a condition variable.
//!
//! [`SignalMutex`] bundles one lock and one condition variable so that the
//! value behind the lock and the signal that announces changes to it travel
//! together. Unlocking is done by dropping the guard (or [`SignalMutex::unlock`]
//! to make the release explicit at a call site).
//!
//! Built on `parking_lot`, whose primitives neither poison nor report OS
//! failures, so none of these operations return errors.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A lock and condition variable created and destroyed together.
#[derive(Debug, Default)]
pub struct SignalMutex<T> {
    lock: Mutex<T>,
    signal: Condvar,
}

impl<T> SignalMutex<T> {
    /// Create a new mutex guarding `value`.
    pub fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(value),
            signal: Condvar::new(),
        }
    }

    /// Acquire the lock without blocking.
    ///
    /// Returns `None` if another thread holds it.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.lock.try_lock()
    }

    /// Acquire the lock, blocking until it is available.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.lock()
    }

    /// Release a held lock.
    #[inline]
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Lock, then block until signaled. Returns with the lock re-acquired.
    pub fn wait_for_signal(&self) -> MutexGuard<'_, T> {
        let mut guard = self.lock.lock();
        self.signal.wait(&mut guard);
        guard
    }

    /// Release the already-held lock, block until signaled, re-acquire.
    ///
    /// Spurious wakeups are possible; callers re-check their condition.
    #[inline]
    pub fn wait(&self, guard: &mut MutexGuard<'_, T>) {
        self.signal.wait(guard);
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` if woken before the timeout elapsed.
    pub fn wait_timeout(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        !self.signal.wait_for(guard, timeout).timed_out()
    }

    /// Block while `condition` holds, for at most `timeout` in total.
    ///
    /// Returns `true` if the condition cleared before the deadline.
    pub fn wait_while_for<F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        mut condition: F,
        timeout: Duration,
    ) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while condition(&mut **guard) {
            if self.signal.wait_until(guard, deadline).timed_out() {
                return !condition(&mut **guard);
            }
        }
        true
    }

    /// Wake one waiter. Returns whether a thread was woken.
    #[inline]
    pub fn signal(&self) -> bool {
        self.signal.notify_one()
    }

    /// Wake every waiter. Returns the number of threads woken.
    #[inline]
    pub fn signal_all(&self) -> usize {
        self.signal.notify_all()
    }

    /// Consume the mutex and return the guarded value.
    pub fn into_inner(self) -> T {
        self.lock.into_inner()
    }
}
