// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Double-buffered many-producer, single-consumer message queue.
//!
//! Two fixed buffers alternate roles: producers append frames to the "in"
//! buffer under the mutex, while the consumer drains the "out" buffer with
//! no lock at all. Only when "out" is empty and "in" has data does the
//! consumer swap the roles, and it does so with a try-lock: if a producer
//! holds the mutex the dequeue reports [`QueueError::BufferEmpty`] instead
//! of waiting.
//!
//! ```text
//!  producers ──lock──► [ in  ]      swap (try_lock, only when out is drained)
//!                      [ out ] ──► consumer (no lock)
//! ```

use super::frame::{self, ByteStore, HEADER_LEN};
use super::{check_capacity, deliver, DequeueCallback, QueueError};
use crate::sync::SignalMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// One half of the double buffer.
struct QueueBuffer {
    store: ByteStore,
    /// Bytes written since the last reset. Peeked without the lock.
    used: AtomicUsize,
    /// Frames not yet read.
    msgs: AtomicUsize,
    /// Offset of the next unread frame.
    cursor: AtomicUsize,
}

impl QueueBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            store: ByteStore::new(capacity),
            used: AtomicUsize::new(0),
            msgs: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    fn reset(&self) {
        self.used.store(0, Ordering::Relaxed);
        self.msgs.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
    }
}

struct QueueInner {
    buffers: [QueueBuffer; 2],
    /// Index of the buffer producers write to. The other one is "out".
    in_index: SignalMutex<usize>,
}

impl QueueInner {
    #[inline]
    fn capacity(&self) -> usize {
        self.buffers[0].store.len()
    }
}

/// A double-buffered queue, ready to be split into its producer and
/// consumer ends.
pub struct DoubleBufferQueue {
    inner: Arc<QueueInner>,
    callback: Option<DequeueCallback>,
}

impl DoubleBufferQueue {
    /// Create a queue with two buffers of `buffer_bytes` each.
    ///
    /// A single message (plus its 4-byte header) must fit in one buffer.
    pub fn new(buffer_bytes: usize) -> Result<Self, QueueError> {
        let capacity = check_capacity(buffer_bytes)?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                buffers: [QueueBuffer::new(capacity), QueueBuffer::new(capacity)],
                in_index: SignalMutex::new(0),
            }),
            callback: None,
        })
    }

    /// Register a callback that receives each dequeued payload.
    pub fn with_callback(mut self, callback: DequeueCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Size of each of the two buffers.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Split into a cloneable producer and the single consumer.
    pub fn split(self) -> (DoubleBufferProducer, DoubleBufferConsumer) {
        (
            DoubleBufferProducer {
                inner: Arc::clone(&self.inner),
            },
            DoubleBufferConsumer {
                inner: self.inner,
                out_index: 1,
                callback: self.callback,
                swaps: 0,
            },
        )
    }
}

/// Producer end. Clone it for each producing thread.
#[derive(Clone)]
pub struct DoubleBufferProducer {
    inner: Arc<QueueInner>,
}

impl DoubleBufferProducer {
    /// Append a message made of `segments` to the "in" buffer.
    ///
    /// Blocks only on the queue mutex. Returns [`QueueError::BufferFull`]
    /// if the frame does not fit in what remains of the "in" buffer; a
    /// frame larger than a whole buffer never fits.
    pub fn enqueue(&self, segments: &[&[u8]]) -> Result<(), QueueError> {
        let inner = &*self.inner;
        let needed = frame::framed_len(segments);

        let guard = inner.in_index.lock();
        let buffer = &inner.buffers[*guard];
        let used = buffer.used.load(Ordering::Relaxed);
        let available = buffer.store.len() - used;
        if needed > available {
            return Err(QueueError::BufferFull { needed, available });
        }

        // SAFETY: the "in" buffer is only written while holding the lock,
        // and the consumer does not read it until it swaps under the lock.
        unsafe { buffer.store.write_frame(used, segments) };
        buffer.msgs.fetch_add(1, Ordering::Relaxed);
        buffer.used.store(used + needed, Ordering::Release);
        SignalMutex::unlock(guard);

        inner.in_index.signal();
        Ok(())
    }

    /// Size of each of the two buffers.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Consumer end. Exactly one exists per queue.
pub struct DoubleBufferConsumer {
    inner: Arc<QueueInner>,
    /// Index of the buffer being drained. Only this consumer changes the
    /// roles, so it can track "out" without the lock.
    out_index: usize,
    callback: Option<DequeueCallback>,
    swaps: u64,
}

impl DoubleBufferConsumer {
    /// Dequeue the next message.
    ///
    /// With a registered callback the payload goes to the callback and `out`
    /// is left untouched; otherwise it is copied into `out`. Returns the
    /// payload length. If `out` is too small the message stays queued.
    pub fn dequeue(&mut self, out: &mut [u8]) -> Result<usize, QueueError> {
        let (offset, len) = self.next_frame()?;
        let buffer = &self.inner.buffers[self.out_index];
        // SAFETY: the "out" buffer is read only by this consumer and not
        // written by producers until it is swapped back in.
        let payload = unsafe { buffer.store.slice(offset + HEADER_LEN, len) };
        let n = deliver(payload, self.callback.as_mut(), out)?;
        self.advance(offset, len);
        Ok(n)
    }

    /// Dequeue the next message by lending its payload to `f`.
    pub fn dequeue_with<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Result<R, QueueError> {
        let (offset, len) = self.next_frame()?;
        let buffer = &self.inner.buffers[self.out_index];
        // SAFETY: see `dequeue`.
        let payload = unsafe { buffer.store.slice(offset + HEADER_LEN, len) };
        let result = f(payload);
        self.advance(offset, len);
        Ok(result)
    }

    /// Payload length of the next message, without consuming it.
    ///
    /// May swap buffers, exactly as `dequeue` would.
    pub fn dequeue_byte_count(&mut self) -> Result<usize, QueueError> {
        self.next_frame().map(|(_, len)| len)
    }

    /// Whether a message can be dequeued right now.
    pub fn msg_waiting(&mut self) -> bool {
        self.next_frame().is_ok()
    }

    /// Block until a message is available or `timeout` elapses.
    ///
    /// Returns `true` if a message is ready to dequeue. Not for use on a
    /// real-time thread.
    pub fn wait_for_message(&mut self, timeout: Duration) -> bool {
        if self.msg_waiting() {
            return true;
        }

        let inner = &*self.inner;
        let mut guard = inner.in_index.lock();
        let ready = inner.in_index.wait_while_for(
            &mut guard,
            |in_index| inner.buffers[*in_index].used.load(Ordering::Acquire) == 0,
            timeout,
        );
        if ready {
            swap_roles(inner, &mut guard, &mut self.out_index);
            self.swaps += 1;
        }
        ready
    }

    /// Replace the dequeue callback.
    pub fn set_callback(&mut self, callback: Option<DequeueCallback>) {
        self.callback = callback;
    }

    /// Number of buffer swaps performed so far.
    pub fn swap_count(&self) -> u64 {
        self.swaps
    }

    /// Size of each of the two buffers.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Locate the next frame in the "out" buffer, swapping if it is drained.
    ///
    /// Returns `(frame offset, payload length)`.
    fn next_frame(&mut self) -> Result<(usize, usize), QueueError> {
        for _ in 0..2 {
            let buffer = &self.inner.buffers[self.out_index];
            if buffer.msgs.load(Ordering::Acquire) > 0 {
                let cursor = buffer.cursor.load(Ordering::Relaxed);
                // SAFETY: cursor points at an unread frame of the "out" buffer.
                let len = unsafe { buffer.store.read_len(cursor) } as usize;
                return Ok((cursor, len));
            }
            if !self.try_swap() {
                break;
            }
        }
        Err(QueueError::BufferEmpty)
    }

    /// Swap roles if "in" has data and the lock is free right now.
    fn try_swap(&mut self) -> bool {
        let in_index = 1 - self.out_index;
        if self.inner.buffers[in_index].used.load(Ordering::Acquire) == 0 {
            return false;
        }
        let Some(mut guard) = self.inner.in_index.try_lock() else {
            trace!("double buffer swap skipped, producer holds the lock");
            return false;
        };
        swap_roles(&self.inner, &mut guard, &mut self.out_index);
        self.swaps += 1;
        true
    }

    fn advance(&mut self, offset: usize, len: usize) {
        let buffer = &self.inner.buffers[self.out_index];
        buffer
            .cursor
            .store(offset + HEADER_LEN + len, Ordering::Relaxed);
        buffer.msgs.fetch_sub(1, Ordering::Release);
    }
}

/// Make the drained "out" buffer the new write target and start draining
/// the old "in" buffer. Caller holds the lock (`in_index` is its guard).
fn swap_roles(inner: &QueueInner, in_index: &mut usize, out_index: &mut usize) {
    inner.buffers[*out_index].reset();
    std::mem::swap(in_index, out_index);
    trace!(
        out = *out_index,
        msgs = inner.buffers[*out_index].msgs.load(Ordering::Relaxed),
        "double buffer swap"
    );
}
