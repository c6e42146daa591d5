// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Message framing shared by both queue types.
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (LE)  | payload (len bytes)       |
//! +----------------+---------------------------+
//! ```
//!
//! A length of [`WRAP_SENTINEL`] means "nothing else lives past this point,
//! continue at offset 0". Capacities are capped at [`MAX_CAPACITY`] so a real
//! frame can never carry the sentinel as its length.

use std::cell::UnsafeCell;
use std::ptr;

/// Bytes taken by the length prefix.
pub const HEADER_LEN: usize = 4;

/// Reserved length marking a wrap back to offset 0.
pub const WRAP_SENTINEL: u32 = u32::MAX;

/// Largest backing buffer either queue accepts.
pub const MAX_CAPACITY: usize = (u32::MAX - 1) as usize;

/// Total payload length of a multi-segment message.
#[inline]
pub fn payload_len(segments: &[&[u8]]) -> usize {
    segments.iter().map(|s| s.len()).sum()
}

/// Bytes a message occupies once framed.
#[inline]
pub fn framed_len(segments: &[&[u8]]) -> usize {
    HEADER_LEN + payload_len(segments)
}

/// Fixed-size byte storage shared between threads.
///
/// Allocated once at queue creation. All access goes through raw pointers;
/// the owning queue decides which thread may touch which byte range.
pub struct ByteStore {
    cells: Box<[UnsafeCell<u8>]>,
}

// SAFETY: ByteStore only hands out access through unsafe methods whose
// callers guarantee that no byte range is written while another thread
// reads or writes it.
unsafe impl Send for ByteStore {}
unsafe impl Sync for ByteStore {}

impl ByteStore {
    /// Allocate `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        let cells: Box<[UnsafeCell<u8>]> = (0..len).map(|_| UnsafeCell::new(0)).collect();
        Self { cells }
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent), so the cells form one
        // contiguous run of bytes.
        UnsafeCell::raw_get(self.cells.as_ptr())
    }

    /// Copy `bytes` into the store at `offset`.
    ///
    /// # Safety
    /// `offset..offset + bytes.len()` must be in bounds and not accessed by
    /// any other thread for the duration of the call.
    #[inline]
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len());
        ptr::copy_nonoverlapping(bytes.as_ptr(), self.base().add(offset), bytes.len());
    }

    /// Borrow `len` bytes starting at `offset`.
    ///
    /// # Safety
    /// The range must be in bounds and must not be written by any thread
    /// while the returned slice is alive.
    #[inline]
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len());
        std::slice::from_raw_parts(self.base().add(offset), len)
    }

    /// Write a length prefix at `offset`.
    ///
    /// # Safety
    /// Same contract as [`write`](Self::write) for `HEADER_LEN` bytes.
    #[inline]
    pub unsafe fn write_len(&self, offset: usize, len: u32) {
        self.write(offset, &len.to_le_bytes());
    }

    /// Read a length prefix at `offset`.
    ///
    /// # Safety
    /// Same contract as [`slice`](Self::slice) for `HEADER_LEN` bytes.
    #[inline]
    pub unsafe fn read_len(&self, offset: usize) -> u32 {
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(self.slice(offset, HEADER_LEN));
        u32::from_le_bytes(raw)
    }

    /// Write a complete frame (header then segments) at `offset`.
    ///
    /// Returns the offset just past the frame.
    ///
    /// # Safety
    /// `offset..offset + framed_len(segments)` must satisfy the contract of
    /// [`write`](Self::write), and the payload length must fit in a `u32`
    /// other than [`WRAP_SENTINEL`].
    pub unsafe fn write_frame(&self, offset: usize, segments: &[&[u8]]) -> usize {
        let len = payload_len(segments);
        debug_assert!(len < WRAP_SENTINEL as usize);
        self.write_len(offset, len as u32);
        let mut cursor = offset + HEADER_LEN;
        for segment in segments {
            self.write(cursor, segment);
            cursor += segment.len();
        }
        cursor
    }
}

impl std::fmt::Debug for ByteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStore").field("len", &self.len()).finish()
    }
}
