// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cooperative worker thread with pause/resume/exit control.
//!
//! The worker repeatedly calls a client step function on a dedicated thread.
//! Other threads steer it through request flags; the worker consumes them
//! between steps and publishes its state. A running step is never
//! interrupted.
//!
//! ```text
//!  NotInit ──start──► Paused ◄──pause── Running
//!                       │ ──resume──────►  │
//!                       └──exit──► Exited ◄┘ (exit request, step returned false, or panic)
//! ```
//!
//! Only the worker thread writes the state; only callers write the request
//! flags. Both meet in one [`SignalMutex`] so that a waiting caller is woken
//! as soon as the state changes and a paused worker is woken as soon as a
//! request arrives.

use crate::config::WorkerConfig;
use crate::sync::SignalMutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Published state of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Spawned but not yet running its loop.
    NotInit,
    Paused,
    Running,
    Exited,
}

/// Why a worker thread left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// An exit was requested (`destroy` or drop).
    Requested,
    /// The step function returned `false`.
    Completed,
    /// The step function panicked.
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("Failed to create worker thread: {0}")]
    CreateFailed(String),
    #[error("Timed out after {waited:?} waiting for worker state {target:?}")]
    TimedOut { target: ThreadState, waited: Duration },
    #[error("Worker thread has exited ({0:?})")]
    Exited(ExitReason),
}

const REQUEST_EXIT: u8 = 1 << 0;
const REQUEST_PAUSE: u8 = 1 << 1;
const REQUEST_RUN: u8 = 1 << 2;

#[derive(Debug)]
struct Status {
    state: ThreadState,
    exit_reason: Option<ExitReason>,
}

struct Shared {
    status: SignalMutex<Status>,
    requests: AtomicU8,
    pause_interval: Duration,
}

impl Shared {
    /// Set `flag`, clear `cancels`, and wake the worker if it is idling.
    fn request(&self, flag: u8, cancels: u8) {
        self.requests.fetch_and(!cancels, Ordering::AcqRel);
        self.requests.fetch_or(flag, Ordering::AcqRel);
        // Taking the lock orders this request after a worker that checked
        // the flags under the lock and is about to wait.
        drop(self.status.lock());
        self.status.signal_all();
    }

    #[inline]
    fn is_requested(&self, flag: u8) -> bool {
        self.requests.load(Ordering::Acquire) & flag != 0
    }

    /// Clear `flag`, returning whether it was set.
    #[inline]
    fn take(&self, flag: u8) -> bool {
        self.requests.fetch_and(!flag, Ordering::AcqRel) & flag != 0
    }

    fn publish(&self, state: ThreadState, exit_reason: Option<ExitReason>) {
        let mut status = self.status.lock();
        status.state = state;
        if exit_reason.is_some() {
            status.exit_reason = exit_reason;
        }
        SignalMutex::unlock(status);
        self.status.signal_all();
    }

    /// Sleep for one pause interval unless a resume or exit is pending.
    fn idle(&self) {
        let mut status = self.status.lock();
        if !self.is_requested(REQUEST_RUN | REQUEST_EXIT) {
            self.status.wait_timeout(&mut status, self.pause_interval);
        }
    }

    fn state(&self) -> ThreadState {
        self.status.lock().state
    }

    /// Wait up to `timeout` for the worker to publish `target`.
    fn wait_for(&self, target: ThreadState, timeout: Duration) -> Result<(), WorkerError> {
        let start = Instant::now();
        let mut status = self.status.lock();
        self.status.wait_while_for(
            &mut status,
            |s| s.state != target && s.state != ThreadState::Exited,
            timeout,
        );

        match status.state {
            state if state == target => Ok(()),
            ThreadState::Exited => Err(WorkerError::Exited(
                status.exit_reason.unwrap_or(ExitReason::Requested),
            )),
            _ => Err(WorkerError::TimedOut {
                target,
                waited: start.elapsed(),
            }),
        }
    }
}

/// Publishes `Exited` when the worker loop ends, including by panic.
struct ExitGuard {
    shared: Arc<Shared>,
    reason: Option<ExitReason>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let reason = self.reason.unwrap_or(ExitReason::Panicked);
        self.shared.publish(ThreadState::Exited, Some(reason));
    }
}

/// Worker loop (runs on the dedicated thread).
fn run_worker<F>(shared: Arc<Shared>, mut step: F)
where
    F: FnMut() -> bool,
{
    let mut guard = ExitGuard {
        shared: Arc::clone(&shared),
        reason: None,
    };

    // Starting paused already satisfies any pause asked for before now.
    shared.take(REQUEST_PAUSE);
    let mut state = ThreadState::Paused;
    shared.publish(state, None);

    let reason = loop {
        if shared.is_requested(REQUEST_EXIT) {
            break ExitReason::Requested;
        }

        if state == ThreadState::Paused {
            shared.idle();
            if shared.take(REQUEST_RUN) {
                state = ThreadState::Running;
                shared.publish(state, None);
                debug!("Worker resumed");
            }
            continue;
        }

        if !step() {
            break ExitReason::Completed;
        }

        if shared.take(REQUEST_PAUSE) {
            state = ThreadState::Paused;
            shared.publish(state, None);
            debug!("Worker paused");
        }
    };

    debug!("Worker leaving loop: {:?}", reason);
    guard.reason = Some(reason);
}

/// Handle to a worker thread.
///
/// Dropping the handle requests exit and waits (bounded) for the thread;
/// a thread that does not exit in time is detached.
pub struct WorkerThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    wait_timeout: Duration,
    name: String,
}

impl WorkerThread {
    /// Spawn a worker with default settings. It starts paused.
    pub fn spawn<F>(step: F) -> Result<Self, WorkerError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::with_config(&WorkerConfig::default(), step)
    }

    /// Spawn a worker using `config` for its name and wait intervals.
    ///
    /// The thread starts paused; call `pause(false, ..)` to start stepping.
    pub fn with_config<F>(config: &WorkerConfig, step: F) -> Result<Self, WorkerError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shared = Arc::new(Shared {
            status: SignalMutex::new(Status {
                state: ThreadState::NotInit,
                exit_reason: None,
            }),
            requests: AtomicU8::new(0),
            pause_interval: config.pause_interval(),
        });

        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_worker(shared, step)
            })
            .map_err(|e| WorkerError::CreateFailed(e.to_string()))?;

        info!("Spawned worker thread '{}'", config.name);

        Ok(Self {
            shared,
            handle: Some(handle),
            wait_timeout: config.wait_timeout(),
            name: config.name.clone(),
        })
    }

    /// Request the paused (`pause == true`) or running state.
    ///
    /// A no-op if that state already holds or is already pending. With
    /// `wait`, blocks until the worker publishes the state or the wait
    /// timeout elapses.
    pub fn pause(&self, pause: bool, wait: bool) -> Result<(), WorkerError> {
        let (target, flag, cancels) = if pause {
            (ThreadState::Paused, REQUEST_PAUSE, REQUEST_RUN)
        } else {
            (ThreadState::Running, REQUEST_RUN, REQUEST_PAUSE)
        };

        let current = self.shared.state();
        if current == ThreadState::Exited {
            return Err(WorkerError::Exited(self.exit_reason().unwrap_or(ExitReason::Requested)));
        }

        if self.logical_state(current) != target {
            debug!("Worker '{}': requesting {:?}", self.name, target);
            self.shared.request(flag, cancels);
        }

        if wait {
            if let Err(e) = self.shared.wait_for(target, self.wait_timeout) {
                if matches!(e, WorkerError::TimedOut { .. }) {
                    warn!("Worker '{}': {}", self.name, e);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Shorthand for `pause(false, wait)`.
    pub fn resume(&self, wait: bool) -> Result<(), WorkerError> {
        self.pause(false, wait)
    }

    /// Ask the worker to exit and wait (bounded) for it, then join it.
    ///
    /// On timeout the thread is left untouched and this handle stays
    /// usable, so the call can be retried.
    pub fn destroy(&mut self) -> Result<ExitReason, WorkerError> {
        if self.handle.is_some() {
            self.shared.request(REQUEST_EXIT, 0);
            match self.shared.wait_for(ThreadState::Exited, self.wait_timeout) {
                Ok(()) | Err(WorkerError::Exited(_)) => {}
                Err(e) => {
                    warn!("Worker '{}' did not exit: {}", self.name, e);
                    return Err(e);
                }
            }

            if let Some(handle) = self.handle.take() {
                // A panic was already recorded as the exit reason.
                let _ = handle.join();
            }
            info!("Worker thread '{}' exited", self.name);
        }

        Ok(self.exit_reason().unwrap_or(ExitReason::Requested))
    }

    /// Current published state.
    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    /// Why the worker exited, once it has.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.shared.status.lock().exit_reason
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound on `pause(.., true)` and `destroy` waits.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn set_wait_timeout(&mut self, timeout: Duration) {
        self.wait_timeout = timeout;
    }

    /// The state the worker is heading for, counting pending requests.
    fn logical_state(&self, current: ThreadState) -> ThreadState {
        if self.shared.is_requested(REQUEST_PAUSE) {
            ThreadState::Paused
        } else if self.shared.is_requested(REQUEST_RUN) {
            ThreadState::Running
        } else {
            current
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.handle.is_some() && self.destroy().is_err() {
            warn!("Detaching worker thread '{}'", self.name);
        }
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}
