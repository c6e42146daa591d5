// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Framed byte queues for talking to the real-time thread.
//!
//! Both queues carry variable-length messages as length-prefixed frames
//! inside a fixed buffer allocated once at creation; nothing allocates on
//! the enqueue or dequeue path.
//!
//! | Queue | Producers | Consumer | Locks |
//! |---|---|---|---|
//! | [`SpscRing`] | exactly one | exactly one | none |
//! | [`DoubleBufferQueue`] | any number | exactly one | producers always, consumer only on swap (try-lock) |
//!
//! # Real-Time Safety
//!
//! The consumer side of both queues never blocks: a dequeue either returns a
//! message or [`QueueError::BufferEmpty`]. The SPSC producer never blocks
//! either. Double-buffer producers take a short lock per message.

pub mod double_buffer;
pub mod frame;
pub mod spsc_ring;

pub use double_buffer::{DoubleBufferConsumer, DoubleBufferProducer, DoubleBufferQueue};
pub use spsc_ring::{SpscConsumer, SpscProducer, SpscRing};

use thiserror::Error;

/// Callback invoked by a consumer with each dequeued payload.
///
/// When registered, `dequeue` hands the payload to the callback instead of
/// copying it into the caller's buffer.
pub type DequeueCallback = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Buffer full: message needs {needed} bytes, {available} available")]
    BufferFull { needed: usize, available: usize },
    #[error("Buffer empty")]
    BufferEmpty,
    #[error("Return buffer too small: message is {needed} bytes, buffer holds {provided}")]
    ReturnBufferTooSmall { needed: usize, provided: usize },
    #[error("Invalid capacity {requested} (must be 1..={max} bytes)")]
    InvalidCapacity { requested: usize, max: usize },
}

impl QueueError {
    /// Whether the condition clears on its own (drain or refill and retry).
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::BufferFull { .. } | QueueError::BufferEmpty)
    }
}

/// Validate a requested backing buffer size.
pub(crate) fn check_capacity(requested: usize) -> Result<usize, QueueError> {
    if requested == 0 || requested > frame::MAX_CAPACITY {
        return Err(QueueError::InvalidCapacity {
            requested,
            max: frame::MAX_CAPACITY,
        });
    }
    Ok(requested)
}

/// Deliver a payload either to the registered callback or into `out`.
pub(crate) fn deliver(
    payload: &[u8],
    callback: Option<&mut DequeueCallback>,
    out: &mut [u8],
) -> Result<usize, QueueError> {
    match callback {
        Some(cb) => cb(payload),
        None => {
            if out.len() < payload.len() {
                return Err(QueueError::ReturnBufferTooSmall {
                    needed: payload.len(),
                    provided: out.len(),
                });
            }
            out[..payload.len()].copy_from_slice(payload);
        }
    }
    Ok(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(QueueError::BufferEmpty.is_retryable());
        assert!(QueueError::BufferFull {
            needed: 8,
            available: 2
        }
        .is_retryable());
        assert!(!QueueError::ReturnBufferTooSmall {
            needed: 8,
            provided: 2
        }
        .is_retryable());
    }

    #[test]
    fn test_check_capacity() {
        assert!(check_capacity(0).is_err());
        assert_eq!(check_capacity(64), Ok(64));
    }

    #[test]
    fn test_deliver_copy_and_callback() {
        let mut out = [0u8; 4];
        assert_eq!(deliver(b"abc", None, &mut out), Ok(3));
        assert_eq!(&out[..3], b"abc");

        assert_eq!(
            deliver(b"abcdef", None, &mut out),
            Err(QueueError::ReturnBufferTooSmall {
                needed: 6,
                provided: 4
            })
        );

        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut cb: DequeueCallback = {
            let seen = seen.clone();
            Box::new(move |payload| seen.lock().extend_from_slice(payload))
        };
        // Callback delivery ignores the (too small) return buffer.
        assert_eq!(deliver(b"abcdef", Some(&mut cb), &mut []), Ok(6));
        assert_eq!(seen.lock().as_slice(), b"abcdef");
    }
}
