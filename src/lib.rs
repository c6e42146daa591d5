// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! rtlink - moving control and data between a real-time I/O thread and the
//! rest of an application.
//!
//! - [`worker`]: a cooperative worker thread with pause/resume/exit control.
//! - [`sync`]: a mutex + condition variable pair.
//! - [`realtime`]: framed byte queues (a double-buffered many-producer queue
//!   and a lock-free single-producer/single-consumer ring).
//! - [`config`]: TOML configuration for buffer sizes and wait intervals.

pub mod config;
pub mod realtime;
pub mod sync;
pub mod worker;

pub use config::{CoreConfig, QueueConfig, WorkerConfig};
pub use realtime::{
    DequeueCallback, DoubleBufferConsumer, DoubleBufferProducer, DoubleBufferQueue, QueueError,
    SpscConsumer, SpscProducer, SpscRing,
};
pub use sync::SignalMutex;
pub use worker::{ExitReason, ThreadState, WorkerError, WorkerThread};
