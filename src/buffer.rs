//! Buffers crossing the channel/communicator boundary.
//!
//! The spec's "Raw pointer buffers crossing the API" redesign note
//! (spec.md §9) asks for a small value type carrying (address, length,
//! item-size) with the lifetime contract documented at the surface instead
//! of expressed in the type system, since the owning call frame may be many
//! threads away from the event-loop thread that eventually completes the
//! I/O. [`Buffer`] is that value type: it is `Send` but not inherently safe
//! — the caller must keep the pointed-to region alive and exclusively
//! reachable until the associated [`crate::completion::WorkCompletion`]
//! resolves.

use std::slice;

/// A view over a contiguous region of memory, with an item size used by the
/// ring collectives to split the region into per-rank slices.
///
/// # Safety contract
///
/// The region `[addr, addr + len)` must remain valid and, for a mutable
/// buffer, exclusively borrowed by the runtime until the work request
/// created from it reaches a terminal status. Constructing a [`Buffer`] from
/// a slice ties it to that slice's lifetime; constructing one from a raw
/// pointer via [`Buffer::from_raw_parts`] pushes that obligation onto the
/// caller.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    addr: *mut u8,
    len: usize,
    item_size: usize,
    mutable: bool,
    pinned: bool,
}

// SAFETY: a `Buffer` is handed to the event-loop thread specifically so it
// can complete the I/O that the creating thread is waiting on; the caller
// contract (see struct docs) is what keeps this sound, not the type itself.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Builds a read-only buffer over `data`, one byte per item.
    pub fn from_slice(data: &[u8]) -> Self {
        Buffer {
            addr: data.as_ptr() as *mut u8,
            len: data.len(),
            item_size: 1,
            mutable: false,
            pinned: false,
        }
    }

    /// Builds a writable buffer over `data`, one byte per item.
    pub fn from_slice_mut(data: &mut [u8]) -> Self {
        Buffer {
            addr: data.as_mut_ptr(),
            len: data.len(),
            item_size: 1,
            mutable: true,
            pinned: false,
        }
    }

    /// Builds a buffer from a typed slice, recording `size_of::<T>()` as the
    /// item size so ring collectives split on element boundaries.
    pub fn from_typed_mut<T>(data: &mut [T]) -> Self {
        Buffer {
            addr: data.as_mut_ptr() as *mut u8,
            len: std::mem::size_of_val(data),
            item_size: std::mem::size_of::<T>().max(1),
            mutable: true,
            pinned: false,
        }
    }

    /// # Safety
    /// `addr` must be valid for `len` bytes for as long as any work request
    /// built from this buffer is outstanding; if `mutable` the region must
    /// additionally be exclusively accessible for that duration.
    pub unsafe fn from_raw_parts(addr: *mut u8, len: usize, item_size: usize, mutable: bool) -> Self {
        Buffer {
            addr,
            len,
            item_size: item_size.max(1),
            mutable,
            pinned: false,
        }
    }

    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn count(&self) -> usize {
        self.len / self.item_size
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn pinned(&self) -> bool {
        self.pinned
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    /// Produces a buffer aliasing the sub-range `[start, end)` bytes,
    /// inheriting this buffer's item size.
    pub fn slice(&self, start: usize, end: usize) -> Buffer {
        assert!(start <= end && end <= self.len, "slice out of bounds");
        Buffer {
            // SAFETY: `start <= end <= self.len`, so the offset stays within
            // the region this `Buffer` already promises is valid.
            addr: unsafe { self.addr.add(start) },
            len: end - start,
            item_size: self.item_size,
            mutable: self.mutable,
            pinned: self.pinned,
        }
    }

    /// # Safety
    /// The caller must uphold the lifetime/exclusivity contract documented
    /// on the type for the duration the returned slice is used.
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.addr, self.len)
    }

    /// # Safety
    /// Same contract as [`Buffer::as_slice`]; additionally requires the
    /// buffer was constructed as mutable.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert!(self.mutable, "as_mut_slice on a read-only buffer");
        slice::from_raw_parts_mut(self.addr, self.len)
    }
}

/// Splits `[0, count)` into `parts` contiguous ranges as evenly as
/// possible; the last range absorbs any remainder. Used by the ring
/// collectives to carve a buffer into per-rank slices.
pub fn split_ranges(count: usize, parts: usize) -> Vec<(usize, usize)> {
    if parts == 0 {
        return Vec::new();
    }
    let step = count / parts;
    let remainder = count % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let extra = if i >= parts - remainder { 1 } else { 0 };
        let end = start + step + extra;
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// A simple scratch-space arena used to back temporary reduce buffers
/// (`Buffer::AllocTemp`/`FreeTemp` in the original source). Allocations are
/// zero-initialized and freed by dropping the returned [`Scratch`].
#[derive(Debug, Default)]
pub struct Arena;

impl Arena {
    pub fn new() -> Self {
        Arena
    }

    pub fn alloc_temp(&self, bytes: usize) -> Scratch {
        Scratch {
            data: vec![0u8; bytes],
        }
    }
}

/// Owned scratch storage handed out by [`Arena::alloc_temp`]. Freed on drop.
#[derive(Debug)]
pub struct Scratch {
    data: Vec<u8>,
}

impl Scratch {
    pub fn buffer(&mut self, item_size: usize) -> Buffer {
        Buffer::from_slice_mut(&mut self.data).with_item_size(item_size)
    }
}

impl Buffer {
    fn with_item_size(mut self, item_size: usize) -> Self {
        self.item_size = item_size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_aliases_subrange() {
        let mut data = vec![0u8; 16];
        let buf = Buffer::from_slice_mut(&mut data);
        let sub = buf.slice(4, 8);
        assert_eq!(sub.len(), 4);
        unsafe {
            sub.as_mut_slice()[0] = 42;
        }
        assert_eq!(data[4], 42);
    }

    #[test]
    fn split_ranges_absorbs_remainder_in_last() {
        let ranges = split_ranges(10, 3);
        assert_eq!(ranges, vec![(0, 3), (3, 6), (6, 10)]);
        let total: usize = ranges.iter().map(|(s, e)| e - s).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn split_ranges_exact() {
        assert_eq!(split_ranges(9, 3), vec![(0, 3), (3, 6), (6, 9)]);
    }

    #[test]
    fn scratch_roundtrip() {
        let arena = Arena::new();
        let mut scratch = arena.alloc_temp(8);
        let mut buf = scratch.buffer(4);
        unsafe {
            buf.as_mut_slice()[0] = 7;
        }
        assert_eq!(buf.count(), 2);
    }
}
