//! Component A: the ring buffer primitive (§4.A).
//!
//! Fixed-size, power-of-two byte region sliced into `n_subbufs` sub-buffers.
//! Holds raw event bytes plus the per-sub-buffer reserve/commit accounting
//! that components B and C operate on. The reservation and delivery
//! protocols live in [`crate::reserve`] and [`crate::delivery`]; this module
//! only owns the memory, the atomics, and the bit-exact offset arithmetic.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::ConfigError;
use crate::header::SUBBUF_HEADER_LEN;
use crate::sync::Semaphore;

/// A deliver callback: "sub-buffer index `K` is now ready for the reader"
/// (§4.C). Invoked exactly once per `(sub-buffer, generation)` under the
/// equality test in I3/I5.
pub type DeliverFn = Box<dyn Fn(usize) + Send + Sync>;

/// The shared ring buffer: many writer threads reserve/commit slots, a
/// single reader thread drains finished sub-buffers. No lock is ever held on
/// the writer fast path.
pub struct Buffer {
    start: NonNull<u8>,
    layout: Layout,
    subbuf_size: u32,
    n_subbufs: u32,
    alloc_size: u32,
    overwrite: bool,
    blocking: bool,

    offset: AtomicU32,
    consumed: AtomicU32,
    reserve_count: Box<[AtomicU32]>,
    commit_count: Box<[AtomicU32]>,
    events_lost: AtomicU64,
    corrupted_subbuffers: AtomicU64,
    writer_sem: Semaphore,
    deliver: DeliverFn,
}

// SAFETY: `start` points at a heap allocation owned exclusively by this
// `Buffer`; all access to it goes through the atomic reserve/commit protocol
// in `reserve`/`delivery`, which is the thing that actually makes concurrent
// access to the pointed-to bytes sound.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocates a new ring buffer of `subbuf_size * n_subbufs` bytes.
    ///
    /// Fails with [`ConfigError`] if either size is not a power of two, if
    /// the product overflows a 32-bit address space, or if a sub-buffer
    /// can't even hold its own header. Infallible during steady state
    /// afterwards, per §4.A.
    pub fn new(
        subbuf_size: u32,
        n_subbufs: u32,
        overwrite: bool,
        blocking: bool,
        deliver: DeliverFn,
    ) -> Result<Self, ConfigError> {
        if subbuf_size == 0 || !subbuf_size.is_power_of_two() {
            return Err(ConfigError::SubbufSizeNotPowerOfTwo(subbuf_size));
        }
        if n_subbufs == 0 || !n_subbufs.is_power_of_two() {
            return Err(ConfigError::NSubbufsNotPowerOfTwo(n_subbufs));
        }
        if subbuf_size < SUBBUF_HEADER_LEN {
            return Err(ConfigError::SubbufTooSmall(subbuf_size, SUBBUF_HEADER_LEN));
        }
        let alloc_size = subbuf_size
            .checked_mul(n_subbufs)
            .ok_or(ConfigError::AllocSizeOverflow)?;

        let align = page_size::get().max(std::mem::align_of::<usize>());
        let layout = Layout::from_size_align(alloc_size as usize, align)
            .map_err(|_| ConfigError::AllocationFailed)?;
        // SAFETY: layout has nonzero size (subbuf_size/n_subbufs are both
        // nonzero powers of two) and a valid alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let start = NonNull::new(raw).ok_or(ConfigError::AllocationFailed)?;

        let n = n_subbufs as usize;
        let reserve_count = (0..n).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
        let commit_count = (0..n).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();

        Ok(Buffer {
            start,
            layout,
            subbuf_size,
            n_subbufs,
            alloc_size,
            overwrite,
            blocking,
            offset: AtomicU32::new(0),
            consumed: AtomicU32::new(0),
            reserve_count: reserve_count.into_boxed_slice(),
            commit_count: commit_count.into_boxed_slice(),
            events_lost: AtomicU64::new(0),
            corrupted_subbuffers: AtomicU64::new(0),
            writer_sem: Semaphore::new(n),
            deliver,
        })
    }

    pub fn subbuf_size(&self) -> u32 {
        self.subbuf_size
    }

    pub fn n_subbufs(&self) -> u32 {
        self.n_subbufs
    }

    pub fn alloc_size(&self) -> u32 {
        self.alloc_size
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn blocking(&self) -> bool {
        self.blocking
    }

    pub fn events_lost(&self) -> u64 {
        self.events_lost.load(Ordering::Relaxed)
    }

    pub fn corrupted_subbuffers(&self) -> u64 {
        self.corrupted_subbuffers.load(Ordering::Relaxed)
    }

    pub(crate) fn offset(&self) -> &AtomicU32 {
        &self.offset
    }

    pub(crate) fn consumed(&self) -> &AtomicU32 {
        &self.consumed
    }

    pub(crate) fn reserve_count(&self, idx: usize) -> &AtomicU32 {
        &self.reserve_count[idx]
    }

    pub(crate) fn commit_count(&self, idx: usize) -> &AtomicU32 {
        &self.commit_count[idx]
    }

    pub(crate) fn writer_sem(&self) -> &Semaphore {
        &self.writer_sem
    }

    pub(crate) fn record_event_lost(&self) {
        self.events_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_corruption(&self) {
        self.corrupted_subbuffers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deliver(&self, idx: usize) {
        (self.deliver)(idx);
    }

    /// `start + (offset mod alloc_size)`, per §4.A.
    fn slot_ptr(&self, offset: u32) -> *mut u8 {
        let idx = (offset & (self.alloc_size - 1)) as usize;
        // SAFETY: idx < alloc_size, which is exactly the allocation's length.
        unsafe { self.start.as_ptr().add(idx) }
    }

    /// Mutable view of `len` bytes starting at `offset`.
    ///
    /// Sound as long as the caller holds a reservation covering
    /// `[offset, offset + len)` that no one else has committed over; the
    /// reservation protocol in `reserve`/`delivery` is what establishes that.
    pub(crate) unsafe fn slot_mut(&self, offset: u32, len: u32) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.slot_ptr(offset), len as usize)
    }

    /// Read-only view, used by the reader once a sub-buffer is deliverable.
    pub(crate) unsafe fn slot(&self, offset: u32, len: u32) -> &[u8] {
        std::slice::from_raw_parts(self.slot_ptr(offset), len as usize)
    }

    /// `SUBBUF_INDEX(o) = (o mod alloc_size) / subbuf_size`
    pub(crate) fn subbuf_index(&self, offset: u32) -> usize {
        ((offset & (self.alloc_size - 1)) / self.subbuf_size) as usize
    }

    /// `SUBBUF_OFFSET(o) = o mod subbuf_size`
    pub(crate) fn subbuf_offset(&self, offset: u32) -> u32 {
        offset & (self.subbuf_size - 1)
    }

    /// `SUBBUF_ALIGN(o) = (o + subbuf_size) & ~(subbuf_size-1)`
    pub(crate) fn subbuf_align(&self, offset: u32) -> u32 {
        offset.wrapping_add(self.subbuf_size) & !(self.subbuf_size - 1)
    }

    /// `SUBBUF_TRUNC(o) = o & ~(subbuf_size-1)`
    pub(crate) fn subbuf_trunc(&self, offset: u32) -> u32 {
        offset & !(self.subbuf_size - 1)
    }

    /// Rough count of sub-buffers the writer has closed out ahead of the
    /// reader. Used only to pick a daemon poll priority class (§4.D); never
    /// consulted by the reservation or delivery protocols themselves.
    pub(crate) fn pending_subbufs(&self) -> u32 {
        let off = self.subbuf_trunc(self.offset.load(Ordering::Relaxed));
        let consumed = self.subbuf_trunc(self.consumed.load(Ordering::Relaxed));
        off.wrapping_sub(consumed) / self.subbuf_size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: `layout` is exactly the layout `start` was allocated with,
        // and no other reference to it can outlive this `Buffer`.
        unsafe {
            dealloc(self.start.as_ptr(), self.layout);
        }
    }
}

/// Wraparound-tolerant "has the cursor reached at least `b`" comparison over
/// the modular-2^32 offset space (§9: "Comparisons use subtraction and sign
/// inspection, never direct `<`/`>`, to tolerate wraparound").
pub(crate) fn ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_deliver() -> DeliverFn {
        Box::new(|_| {})
    }

    #[test]
    fn rejects_non_power_of_two_subbuf_size() {
        let err = Buffer::new(100, 4, false, false, noop_deliver()).unwrap_err();
        assert!(matches!(err, ConfigError::SubbufSizeNotPowerOfTwo(100)));
    }

    #[test]
    fn rejects_non_power_of_two_n_subbufs() {
        let err = Buffer::new(4096, 3, false, false, noop_deliver()).unwrap_err();
        assert!(matches!(err, ConfigError::NSubbufsNotPowerOfTwo(3)));
    }

    #[test]
    fn rejects_subbuf_smaller_than_header() {
        let err = Buffer::new(1, 2, false, false, noop_deliver()).unwrap_err();
        assert!(matches!(err, ConfigError::SubbufTooSmall(..)));
    }

    #[test]
    fn rejects_overflowing_alloc_size() {
        let err = Buffer::new(1 << 30, 1 << 30, false, false, noop_deliver()).unwrap_err();
        assert!(matches!(err, ConfigError::AllocSizeOverflow));
    }

    #[test]
    fn offset_arithmetic_matches_spec() {
        let buf = Buffer::new(256, 4, false, false, noop_deliver()).unwrap();
        assert_eq!(buf.subbuf_index(0), 0);
        assert_eq!(buf.subbuf_index(256), 1);
        assert_eq!(buf.subbuf_index(1024), 0); // wraps: alloc_size == 1024
        assert_eq!(buf.subbuf_offset(300), 300 - 256);
        assert_eq!(buf.subbuf_align(10), 256);
        assert_eq!(buf.subbuf_align(256), 512);
        assert_eq!(buf.subbuf_trunc(300), 256);
    }

    #[test]
    fn ge_tolerates_wraparound() {
        assert!(ge(10, 5));
        assert!(!ge(5, 10));
        assert!(ge(0u32.wrapping_sub(1), u32::MAX - 10));
        assert!(!ge(u32::MAX - 10, 0u32.wrapping_sub(1)));
    }
}
