// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lock-free single-producer single-consumer framed ring buffer.
//!
//! Messages are stored as length-prefixed frames in one contiguous byte
//! buffer. A frame is never split across the physical end of the buffer:
//! when it does not fit, the producer plants a wrap sentinel and restarts at
//! offset 0.
//!
//! # Example
//!
//! ```
//! use rtlink::realtime::SpscRing;
//!
//! let (mut producer, mut consumer) = SpscRing::new(1024).unwrap().split();
//!
//! // Control thread sends a MIDI note-on
//! producer.enqueue(&[&[0x90, 60, 100]]).unwrap();
//!
//! // I/O thread drains it
//! let mut buf = [0u8; 16];
//! let n = consumer.dequeue(&mut buf).unwrap();
//! assert_eq!(&buf[..n], &[0x90u8, 60, 100]);
//! ```
//!
//! # Cursors
//!
//! `write_pos` is stored only by the producer and `read_pos` only by the
//! consumer; each side loads the other's cursor with `Acquire` and publishes
//! its own with `Release`. Both range over `0..=capacity`. The ring is empty
//! when they are equal, so the producer never lets `write_pos` catch up with
//! `read_pos` from behind.

use super::frame::{self, ByteStore, HEADER_LEN, WRAP_SENTINEL};
use super::{check_capacity, deliver, DequeueCallback, QueueError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Shared state of the ring.
struct RingInner {
    store: ByteStore,
    /// Offset just past the last published frame (producer-owned).
    write_pos: AtomicUsize,
    /// Offset of the next unread frame (consumer-owned).
    read_pos: AtomicUsize,
}

impl RingInner {
    #[inline]
    fn capacity(&self) -> usize {
        self.store.len()
    }
}

/// A framed SPSC ring buffer, ready to be split into its two ends.
pub struct SpscRing {
    inner: Arc<RingInner>,
    callback: Option<DequeueCallback>,
}

impl SpscRing {
    /// Create a ring backed by `byte_count` bytes.
    ///
    /// Every frame costs 4 header bytes on top of its payload.
    ///
    /// A frame is always placed contiguously, either at the write cursor or
    /// at offset 0, so an empty ring whose cursors sit mid-buffer can still
    /// reject a frame with [`QueueError::BufferFull`]. Only frames of up to
    /// about `byte_count / 2` bytes (header included) are guaranteed to fit
    /// once the consumer catches up. Producers that retry on `BufferFull`
    /// should keep their frames under that bound.
    pub fn new(byte_count: usize) -> Result<Self, QueueError> {
        let capacity = check_capacity(byte_count)?;
        Ok(Self {
            inner: Arc::new(RingInner {
                store: ByteStore::new(capacity),
                write_pos: AtomicUsize::new(0),
                read_pos: AtomicUsize::new(0),
            }),
            callback: None,
        })
    }

    /// Register a callback that receives each dequeued payload.
    pub fn with_callback(mut self, callback: DequeueCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Split into producer and consumer ends.
    pub fn split(self) -> (SpscProducer, SpscConsumer) {
        (
            SpscProducer {
                inner: Arc::clone(&self.inner),
            },
            SpscConsumer {
                inner: self.inner,
                callback: self.callback,
            },
        )
    }
}

/// Producer end. Exactly one exists per ring.
pub struct SpscProducer {
    inner: Arc<RingInner>,
}

impl SpscProducer {
    /// Append a message made of `segments` as one frame.
    ///
    /// Returns [`QueueError::BufferFull`] without touching shared state if
    /// no contiguous run (at the write cursor or, after wrapping, at offset 0)
    /// can hold the frame.
    pub fn enqueue(&mut self, segments: &[&[u8]]) -> Result<(), QueueError> {
        let inner = &*self.inner;
        let needed = frame::framed_len(segments);
        let end = inner.capacity();
        let write = inner.write_pos.load(Ordering::Relaxed);
        let read = inner.read_pos.load(Ordering::Acquire);

        let offset = match place(write, read, end, needed) {
            Placement::At(offset) => offset,
            Placement::Wrap => {
                // SAFETY: read <= write here, so [write, end) is free.
                if end - write >= HEADER_LEN {
                    unsafe { inner.store.write_len(write, WRAP_SENTINEL) };
                }
                trace!(at = write, "spsc ring wrap");
                0
            }
            Placement::Full => {
                return Err(QueueError::BufferFull {
                    needed,
                    available: free_bytes(write, read, end),
                });
            }
        };

        // SAFETY: `place` only returns runs outside the unread region
        // [read, write), and the consumer never reads past `write_pos`
        // until the store below publishes the frame.
        let next = unsafe { inner.store.write_frame(offset, segments) };
        inner.write_pos.store(next, Ordering::Release);
        Ok(())
    }

    /// Bytes that could currently be enqueued in one frame at best,
    /// header included.
    pub fn available(&self) -> usize {
        let end = self.inner.capacity();
        let write = self.inner.write_pos.load(Ordering::Relaxed);
        let read = self.inner.read_pos.load(Ordering::Acquire);
        free_bytes(write, read, end)
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Consumer end. Exactly one exists per ring.
pub struct SpscConsumer {
    inner: Arc<RingInner>,
    callback: Option<DequeueCallback>,
}

impl SpscConsumer {
    /// Dequeue the next message.
    ///
    /// With a registered callback the payload goes to the callback and `out`
    /// is left untouched; otherwise it is copied into `out`. Returns the
    /// payload length. If `out` is too small the message stays queued.
    pub fn dequeue(&mut self, out: &mut [u8]) -> Result<usize, QueueError> {
        let (offset, len) = self.next_frame()?;
        // SAFETY: the frame lies inside [read, write) which the producer
        // does not touch until read_pos moves past it.
        let payload = unsafe { self.inner.store.slice(offset + HEADER_LEN, len) };
        let n = deliver(payload, self.callback.as_mut(), out)?;
        self.inner
            .read_pos
            .store(offset + HEADER_LEN + len, Ordering::Release);
        Ok(n)
    }

    /// Dequeue the next message by lending its payload to `f`.
    pub fn dequeue_with<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Result<R, QueueError> {
        let (offset, len) = self.next_frame()?;
        // SAFETY: see `dequeue`.
        let payload = unsafe { self.inner.store.slice(offset + HEADER_LEN, len) };
        let result = f(payload);
        self.inner
            .read_pos
            .store(offset + HEADER_LEN + len, Ordering::Release);
        Ok(result)
    }

    /// Payload length of the next message, without consuming it.
    pub fn dequeue_byte_count(&mut self) -> Result<usize, QueueError> {
        self.next_frame().map(|(_, len)| len)
    }

    /// Whether at least one message is waiting.
    pub fn msg_waiting(&mut self) -> bool {
        self.next_frame().is_ok()
    }

    /// Replace the dequeue callback.
    pub fn set_callback(&mut self, callback: Option<DequeueCallback>) {
        self.callback = callback;
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Locate the next frame, following wrap markers.
    ///
    /// Returns `(frame offset, payload length)`.
    fn next_frame(&mut self) -> Result<(usize, usize), QueueError> {
        let inner = &*self.inner;
        let end = inner.capacity();
        let mut read = inner.read_pos.load(Ordering::Relaxed);

        loop {
            let write = inner.write_pos.load(Ordering::Acquire);
            if read == write {
                return Err(QueueError::BufferEmpty);
            }

            // Too little room left for a header: the producer wrapped
            // without a sentinel.
            if end - read < HEADER_LEN {
                read = 0;
                inner.read_pos.store(0, Ordering::Release);
                continue;
            }

            // SAFETY: read != write, so a published header lives here.
            let len = unsafe { inner.store.read_len(read) };
            if len == WRAP_SENTINEL {
                trace!(at = read, "spsc ring sentinel");
                read = 0;
                inner.read_pos.store(0, Ordering::Release);
                continue;
            }

            let len = len as usize;
            debug_assert!(read + HEADER_LEN + len <= end, "frame overruns ring");
            return Ok((read, len));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Write the frame at this offset.
    At(usize),
    /// Plant a wrap marker at the write cursor and write at 0.
    Wrap,
    Full,
}

/// Decide where a frame of `needed` bytes goes.
///
/// Unread bytes are `[read, write)` when `read <= write`, otherwise
/// `[read, end) + [0, write)`. A frame may never end exactly on `read`
/// (that would read back as empty).
fn place(write: usize, read: usize, end: usize, needed: usize) -> Placement {
    if read > write {
        if write + needed < read {
            Placement::At(write)
        } else {
            Placement::Full
        }
    } else if write + needed <= end {
        Placement::At(write)
    } else if needed < read {
        Placement::Wrap
    } else {
        Placement::Full
    }
}

/// Largest contiguous run a single frame could use.
fn free_bytes(write: usize, read: usize, end: usize) -> usize {
    if read > write {
        read - write - 1
    } else {
        (end - write).max(read.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_message() {
        let (mut producer, mut consumer) = SpscRing::new(64).unwrap().split();

        producer.enqueue(&[b"hello"]).unwrap();
        assert_eq!(consumer.dequeue_byte_count(), Ok(5));

        let mut buf = [0u8; 16];
        assert_eq!(consumer.dequeue(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(consumer.dequeue(&mut buf), Err(QueueError::BufferEmpty));
    }

    #[test]
    fn test_full_after_two_frames() {
        let (mut producer, _consumer) = SpscRing::new(16).unwrap().split();

        assert!(producer.enqueue(&[&[1, 2, 3, 4]]).is_ok());
        assert!(producer.enqueue(&[&[5, 6, 7, 8]]).is_ok());
        assert!(matches!(
            producer.enqueue(&[&[9, 10, 11, 12]]),
            Err(QueueError::BufferFull { needed: 8, .. })
        ));
    }

    #[test]
    fn test_full_leaves_state_untouched() {
        let (mut producer, mut consumer) = SpscRing::new(16).unwrap().split();
        producer.enqueue(&[b"abcd"]).unwrap();
        producer.enqueue(&[b"efgh"]).unwrap();

        let before = (
            producer.inner.write_pos.load(Ordering::Relaxed),
            producer.inner.read_pos.load(Ordering::Relaxed),
        );
        assert!(producer.enqueue(&[b"ijkl"]).is_err());
        let after = (
            producer.inner.write_pos.load(Ordering::Relaxed),
            producer.inner.read_pos.load(Ordering::Relaxed),
        );
        assert_eq!(before, after);

        let mut buf = [0u8; 4];
        consumer.dequeue(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        consumer.dequeue(&mut buf).unwrap();
        assert_eq!(&buf, b"efgh");
    }

    #[test]
    fn test_wrap_sentinel() {
        let (mut producer, mut consumer) = SpscRing::new(20).unwrap().split();
        let mut buf = [0u8; 8];

        // 0..8 and 8..16
        producer.enqueue(&[b"aaaa"]).unwrap();
        producer.enqueue(&[b"bbbb"]).unwrap();
        consumer.dequeue(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"aaaa");
        consumer.dequeue(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"bbbb");

        // Read cursor at 16 with 4 bytes left: a 6-byte frame must wrap and
        // leave a sentinel at 16.
        producer.enqueue(&[b"cc"]).unwrap();
        assert_eq!(unsafe { producer.inner.store.read_len(16) }, WRAP_SENTINEL);
        assert_eq!(producer.inner.write_pos.load(Ordering::Relaxed), 6);

        assert_eq!(consumer.dequeue_byte_count(), Ok(2));
        assert_eq!(consumer.dequeue(&mut buf), Ok(2));
        assert_eq!(&buf[..2], b"cc");
        assert_eq!(consumer.dequeue(&mut buf), Err(QueueError::BufferEmpty));
    }

    #[test]
    fn test_implicit_wrap_near_end() {
        let (mut producer, mut consumer) = SpscRing::new(18).unwrap().split();
        let mut buf = [0u8; 16];

        // Leaves 2 bytes at the end, too few for a sentinel.
        producer.enqueue(&[&[7u8; 12]]).unwrap();
        assert_eq!(consumer.dequeue(&mut buf), Ok(12));

        producer.enqueue(&[b"xy"]).unwrap();
        assert_eq!(consumer.dequeue(&mut buf), Ok(2));
        assert_eq!(&buf[..2], b"xy");
    }

    #[test]
    fn test_wrap_blocked_by_reader() {
        let (mut producer, mut consumer) = SpscRing::new(16).unwrap().split();
        let mut buf = [0u8; 8];

        producer.enqueue(&[b"abcd"]).unwrap(); // 0..8
        producer.enqueue(&[b"ef"]).unwrap(); // 8..14
        consumer.dequeue(&mut buf).unwrap(); // read = 8

        // Needs 8, only 2 at the end, and wrapping would end on read.
        assert!(matches!(
            producer.enqueue(&[b"ghij"]),
            Err(QueueError::BufferFull { .. })
        ));
        // A 7-byte frame ends before read.
        producer.enqueue(&[b"ghi"]).unwrap();

        assert_eq!(consumer.dequeue(&mut buf), Ok(2));
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(consumer.dequeue(&mut buf), Ok(3));
        assert_eq!(&buf[..3], b"ghi");
    }

    #[test]
    fn test_multi_segment_and_empty_payload() {
        let (mut producer, mut consumer) = SpscRing::new(32).unwrap().split();

        producer.enqueue(&[b"he", b"ll", b"o"]).unwrap();
        producer.enqueue(&[]).unwrap();

        let got = consumer.dequeue_with(|p| p.to_vec()).unwrap();
        assert_eq!(got, b"hello");
        assert!(consumer.msg_waiting());
        assert_eq!(consumer.dequeue_with(|p| p.len()), Ok(0));
        assert!(!consumer.msg_waiting());
    }

    #[test]
    fn test_return_buffer_too_small_keeps_message() {
        let (mut producer, mut consumer) = SpscRing::new(32).unwrap().split();
        producer.enqueue(&[b"123456"]).unwrap();

        let mut small = [0u8; 3];
        assert_eq!(
            consumer.dequeue(&mut small),
            Err(QueueError::ReturnBufferTooSmall {
                needed: 6,
                provided: 3
            })
        );

        let mut big = [0u8; 6];
        assert_eq!(consumer.dequeue(&mut big), Ok(6));
        assert_eq!(&big, b"123456");
    }

    #[test]
    fn test_callback_delivery() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<Vec<u8>>::new()));
        let ring = {
            let seen = Arc::clone(&seen);
            SpscRing::new(64)
                .unwrap()
                .with_callback(Box::new(move |p| seen.lock().push(p.to_vec())))
        };
        let (mut producer, mut consumer) = ring.split();

        producer.enqueue(&[b"one"]).unwrap();
        producer.enqueue(&[b"two"]).unwrap();
        assert_eq!(consumer.dequeue(&mut []), Ok(3));
        assert_eq!(consumer.dequeue(&mut []), Ok(3));

        assert_eq!(*seen.lock(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_message_larger_than_ring() {
        let (mut producer, _consumer) = SpscRing::new(8).unwrap().split();
        assert!(matches!(
            producer.enqueue(&[&[0u8; 8]]),
            Err(QueueError::BufferFull { needed: 12, .. })
        ));
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            SpscRing::new(0),
            Err(QueueError::InvalidCapacity { requested: 0, .. })
        ));
    }

    #[test]
    fn test_threaded_fifo() {
        const COUNT: u32 = 20_000;
        let (mut producer, mut consumer) = SpscRing::new(256).unwrap().split();

        let writer = thread::spawn(move || {
            for i in 0..COUNT {
                // Vary the length so frames land on every alignment.
                let len = (i % 13) as usize;
                let mut msg = [0u8; 17];
                msg[..4].copy_from_slice(&i.to_le_bytes());
                loop {
                    match producer.enqueue(&[&msg[..4 + len]]) {
                        Ok(()) => break,
                        Err(QueueError::BufferFull { .. }) => thread::yield_now(),
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }
        });

        let mut next = 0u32;
        let mut buf = [0u8; 32];
        while next < COUNT {
            match consumer.dequeue(&mut buf) {
                Ok(n) => {
                    assert_eq!(n, 4 + (next % 13) as usize);
                    let got = u32::from_le_bytes(buf[..4].try_into().unwrap());
                    assert_eq!(got, next);
                    next += 1;
                }
                Err(QueueError::BufferEmpty) => thread::yield_now(),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        writer.join().unwrap();
        assert!(!consumer.msg_waiting());
    }

    #[test]
    fn test_empty_ring_mid_buffer_rejects_large_frame() {
        let (mut producer, mut consumer) = SpscRing::new(16).unwrap().split();

        // Park both cursors at offset 10.
        producer.enqueue(&[&[0u8; 6]]).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(consumer.dequeue(&mut buf), Ok(6));
        assert!(!consumer.msg_waiting());

        // Nothing is unread, but neither [10, 16) nor [0, 10) holds 14 bytes.
        assert_eq!(
            producer.enqueue(&[&[0u8; 10]]),
            Err(QueueError::BufferFull {
                needed: 14,
                available: 9,
            })
        );

        // Half the ring still fits by wrapping.
        producer.enqueue(&[&[7u8; 4]]).unwrap();
        assert_eq!(consumer.dequeue(&mut buf), Ok(4));
        assert_eq!(&buf[..4], &[7u8; 4]);
    }

    #[test]
    fn test_place_rules() {
        assert_eq!(place(0, 0, 16, 16), Placement::At(0));
        assert_eq!(place(16, 0, 16, 8), Placement::Full);
        assert_eq!(place(12, 10, 16, 8), Placement::Wrap);
        assert_eq!(place(12, 8, 16, 8), Placement::Full);
        assert_eq!(place(12, 10, 16, 4), Placement::At(12));
        assert_eq!(place(12, 10, 16, 6), Placement::Wrap);
        assert_eq!(place(2, 10, 16, 7), Placement::At(2));
        assert_eq!(place(2, 10, 16, 8), Placement::Full);
    }
}
