//! Component C: the reader-facing half of the commit/delivery engine (§4.C).
//!
//! `reserve`/`commit` (in [`crate::reserve`]) decide when a sub-buffer is
//! deliverable; this module is how the single reader actually claims and
//! releases one.

use std::sync::atomic::Ordering;

use log::warn;

use crate::buffer::Buffer;
use crate::error::DeliveryError;

/// A claimed, not-yet-released sub-buffer, returned by [`get_next_subbuf`].
#[derive(Clone, Copy, Debug)]
pub struct ReadHandle {
    pub offset: u32,
    pub index: usize,
}

/// Claims the oldest deliverable sub-buffer, if any.
///
/// Returns `DeliveryError::NotReady` both when the sub-buffer at `consumed`
/// hasn't finished committing yet and when the writer hasn't produced
/// anything past `consumed` at all — the two `EAGAIN`-flavored cases §4.C
/// doesn't distinguish.
pub fn get_next_subbuf(buffer: &Buffer) -> Result<ReadHandle, DeliveryError> {
    let consumed_old = buffer.consumed().load(Ordering::Acquire);
    let idx = buffer.subbuf_index(consumed_old);

    if buffer.commit_count(idx).load(Ordering::Acquire) != buffer.reserve_count(idx).load(Ordering::Acquire) {
        return Err(DeliveryError::NotReady);
    }

    let offset = buffer.offset().load(Ordering::Acquire);
    if buffer.subbuf_trunc(offset) == buffer.subbuf_trunc(consumed_old) {
        return Err(DeliveryError::NotReady);
    }

    Ok(ReadHandle {
        offset: consumed_old,
        index: idx,
    })
}

/// Releases a sub-buffer claimed by [`get_next_subbuf`].
///
/// Fails with `InvalidHandle` if `handle` doesn't describe a sub-buffer
/// boundary at all (a forged or stale handle from a different buffer
/// geometry), and with `PushedByWriter` if a writer overran the reader and
/// advanced `consumed` out from under it (an overrun, counted in
/// `corrupted_subbuffers` by the writer that did the pushing). On success, in
/// blocking-writer mode, returns one permit to `writer_sem`.
pub fn put_subbuf(buffer: &Buffer, handle: ReadHandle) -> Result<(), DeliveryError> {
    if buffer.subbuf_offset(handle.offset) != 0 || buffer.subbuf_index(handle.offset) != handle.index {
        warn!(
            "put_subbuf: handle {:?} does not describe a sub-buffer boundary",
            handle
        );
        return Err(DeliveryError::InvalidHandle);
    }

    let consumed_new = buffer.subbuf_align(handle.offset);
    match buffer.consumed().compare_exchange(
        handle.offset,
        consumed_new,
        Ordering::AcqRel,
        Ordering::Relaxed,
    ) {
        Ok(_) => {
            if buffer.blocking() {
                buffer.writer_sem().release();
            }
            Ok(())
        }
        Err(_) => {
            warn!(
                "put_subbuf: sub-buffer {} was overwritten by a writer before the reader released it",
                handle.index
            );
            Err(DeliveryError::PushedByWriter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::reserve::{commit, reserve};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn test_buffer(subbuf_size: u32, n_subbufs: u32, overwrite: bool) -> Arc<Buffer> {
        Arc::new(
            Buffer::new(subbuf_size, n_subbufs, overwrite, false, Box::new(|_| {})).unwrap(),
        )
    }

    #[test]
    fn not_ready_until_a_sub_buffer_closes() {
        let buf = test_buffer(256, 2, false);
        assert!(matches!(
            get_next_subbuf(&buf).unwrap_err(),
            DeliveryError::NotReady
        ));
    }

    #[test]
    fn becomes_ready_once_writer_switches_out() {
        let buf = test_buffer(256, 2, false);
        let clock = MonotonicClock::new();
        // Fill past the first sub-buffer so a switch happens and the first
        // sub-buffer's commit/reserve counts equalize.
        loop {
            match reserve(&buf, 64, &clock) {
                Ok(h) => commit(&buf, &h),
                Err(_) => break,
            }
            if buf.subbuf_index(buf.offset().load(Ordering::SeqCst)) != 0 {
                break;
            }
        }
        let handle = get_next_subbuf(&buf);
        assert!(handle.is_ok(), "expected a deliverable sub-buffer, got {:?}", handle);
        put_subbuf(&buf, handle.unwrap()).unwrap();
    }

    #[test]
    fn put_subbuf_reports_overrun_when_writer_pushed_consumed() {
        let buf = test_buffer(128, 2, true);
        let clock = MonotonicClock::new();
        for _ in 0..200 {
            let _ = reserve(&buf, 32, &clock).map(|h| commit(&buf, &h));
        }
        // Claim a handle, then simulate the writer having pushed consumed
        // forward by advancing it directly before releasing.
        let stale = ReadHandle { offset: 0, index: 0 };
        buf.consumed().store(buf.subbuf_size(), Ordering::SeqCst);
        let result = put_subbuf(&buf, stale);
        assert!(matches!(result, Err(DeliveryError::PushedByWriter)));
    }

    #[test]
    fn put_subbuf_rejects_a_handle_not_on_a_sub_buffer_boundary() {
        let buf = test_buffer(256, 2, false);
        // offset=1 is mid-sub-buffer, not a valid `consumed` value a reader
        // could ever legitimately hold.
        let malformed = ReadHandle { offset: 1, index: 0 };
        assert!(matches!(
            put_subbuf(&buf, malformed),
            Err(DeliveryError::InvalidHandle)
        ));
    }

    #[test]
    fn put_subbuf_rejects_a_handle_with_mismatched_index() {
        let buf = test_buffer(256, 2, false);
        let clock = MonotonicClock::new();
        loop {
            match reserve(&buf, 64, &clock) {
                Ok(h) => commit(&buf, &h),
                Err(_) => break,
            }
            if buf.subbuf_index(buf.offset().load(Ordering::SeqCst)) != 0 {
                break;
            }
        }
        // A correct handle for sub-buffer 0 with its `index` field forged to
        // point at a different sub-buffer.
        let malformed = ReadHandle { offset: 0, index: 1 };
        assert!(matches!(
            put_subbuf(&buf, malformed),
            Err(DeliveryError::InvalidHandle)
        ));
    }

    #[test]
    fn delivery_fires_exactly_once_per_generation() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let buf = Arc::new(
            Buffer::new(
                256,
                2,
                false,
                false,
                Box::new(move |_idx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap(),
        );
        let clock = MonotonicClock::new();
        for _ in 0..50 {
            if let Ok(h) = reserve(&buf, 32, &clock) {
                commit(&buf, &h);
            }
        }
        // Every delivery callback invocation corresponds to a real
        // reserve_count == commit_count transition; it must never exceed the
        // number of sub-buffer generations actually closed.
        let closes = buf.offset().load(Ordering::SeqCst) / buf.subbuf_size();
        assert!(delivered.load(Ordering::SeqCst) as u32 <= closes + 1);
    }
}
