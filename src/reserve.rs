//! Component B: the reservation protocol (§4.B).
//!
//! `reserve` is the lock-free CAS retry loop that allocates a contiguous
//! slot for one writer, switching sub-buffers (and delivering the old one)
//! along the way when necessary. `commit` is the other half: it retires a
//! slot and triggers delivery once every writer that touched a sub-buffer
//! has committed.

use std::sync::atomic::Ordering;

use log::{debug, warn};

use crate::buffer::{ge, Buffer};
use crate::clock::Clock;
use crate::error::ReserveError;
use crate::event::EVENT_HEADER_RAW_LEN;
use crate::header::{BlockStart, CycleMark, TraceHeader, SUBBUF_HEADER_LEN};

const PTR_ALIGN: u32 = std::mem::size_of::<usize>() as u32;

/// Bytes needed to bring `x` up to the next multiple of `align` (`align` a
/// power of two).
fn align_padding(x: u32, align: u32) -> u32 {
    x.wrapping_neg() & (align - 1)
}

/// A reserved slot, returned by [`reserve`] and consumed by [`commit`].
///
/// The caller writes the event header at
/// `begin_offset + header_pad_before`, the payload immediately after it, and
/// then calls [`commit`].
#[derive(Clone, Copy, Debug)]
pub struct SlotHandle {
    pub begin_offset: u32,
    pub slot_size: u32,
    pub tsc: u64,
    pub header_pad_before: u32,
    pub header_pad_after: u32,
    pub header_size: u32,
}

/// Allocates `data_size` bytes for one writer, switching sub-buffers if
/// necessary. Never blocks except, in blocking-writer mode, on `writer_sem`
/// while switching into a freshly closed sub-buffer.
///
/// Returns `None`-equivalent (`Err`) on clock fault, an event too large for
/// one sub-buffer, or (non-blocking, non-overwrite mode) no space left.
pub fn reserve(buffer: &Buffer, data_size: u32, clock: &dyn Clock) -> Result<SlotHandle, ReserveError> {
    let header_pad_after = align_padding(EVENT_HEADER_RAW_LEN, PTR_ALIGN);

    // Step 1-5: the CAS retry loop that picks offset_begin/offset_end.
    let (offset_old, offset_begin, offset_end, end_switch_old, begin_switch, header_pad_before, size, tsc, reserve_commit_diff) = loop {
        let offset_old = buffer.offset().load(Ordering::Relaxed);
        let mut offset_begin = offset_old;
        let mut begin_switch = false;
        let mut end_switch_old = false;
        let mut header_pad_before;
        let mut size;
        let mut reserve_commit_diff = 0u32;
        // Tracks whether this attempt acquired `writer_sem`, so any early
        // return or lost CAS race below can give the permit back instead of
        // leaking it (the permit is only meant to be kept across a
        // successful switch into a freed sub-buffer; see delivery::put_subbuf
        // for the matching release).
        let mut permit_acquired = false;

        let tsc = clock.tsc();
        if tsc == 0 {
            buffer.record_event_lost();
            debug!("reserve: clock source returned 0, dropping event");
            return Err(ReserveError::ClockFault);
        }

        if buffer.subbuf_offset(offset_begin) == 0 {
            // Step 2: exactly on a boundary, a switch is mandatory.
            begin_switch = true;
            header_pad_before = 0;
            size = 0;
        } else {
            header_pad_before = align_padding(offset_begin, PTR_ALIGN);
            size = header_pad_before + EVENT_HEADER_RAW_LEN + header_pad_after + data_size;
            if buffer.subbuf_offset(offset_begin) + size > buffer.subbuf_size() {
                end_switch_old = true;
                begin_switch = true;
            }
        }

        if begin_switch {
            // Step 3.
            if end_switch_old {
                offset_begin = buffer.subbuf_align(offset_begin);
            }
            offset_begin += SUBBUF_HEADER_LEN;

            let idx = buffer.subbuf_index(offset_begin);
            let rc = buffer.reserve_count(idx).load(Ordering::Relaxed);
            let cc = buffer.commit_count(idx).load(Ordering::Relaxed);
            reserve_commit_diff = rc.wrapping_sub(cc);

            if reserve_commit_diff == 0 {
                // Destination sub-buffer is clean.
                if !buffer.overwrite() && ge(offset_begin.wrapping_sub(buffer.consumed().load(Ordering::Relaxed)), buffer.alloc_size()) {
                    buffer.record_event_lost();
                    debug!("reserve: buffer full, non-overwrite mode, dropping event");
                    return Err(ReserveError::TransientFull);
                }
                if buffer.blocking() {
                    // Never taken on the fast path: writers normally succeed
                    // without contention. Signals (here: wakeups) are
                    // suppressed around the wait so the acquiring writer is
                    // guaranteed to also win the offset CAS below.
                    buffer
                        .writer_sem()
                        .with_notifications_suppressed(|| buffer.writer_sem().acquire());
                    permit_acquired = true;
                }
            } else {
                debug!(
                    "reserve: switching into sub-buffer {} while still corrupted (reserve-commit diff {})",
                    idx, reserve_commit_diff
                );
            }

            header_pad_before = align_padding(offset_begin, PTR_ALIGN);
            size = header_pad_before + EVENT_HEADER_RAW_LEN + header_pad_after + data_size;
            if buffer.subbuf_offset(offset_begin) + size > buffer.subbuf_size() {
                buffer.record_event_lost();
                warn!(
                    "reserve: event of {} bytes does not fit in a {}-byte sub-buffer",
                    data_size,
                    buffer.subbuf_size()
                );
                if permit_acquired {
                    buffer.writer_sem().release();
                }
                return Err(ReserveError::Oversize(data_size, buffer.subbuf_size()));
            }
        }

        let offset_end = offset_begin + size;

        if buffer
            .offset()
            .compare_exchange(offset_old, offset_end, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break (
                offset_old,
                offset_begin,
                offset_end,
                end_switch_old,
                begin_switch,
                header_pad_before,
                size,
                tsc,
                reserve_commit_diff,
            );
        }
        // CAS lost the race with another writer: this attempt's switch
        // never happened, so give back any permit it acquired before
        // retrying from step 1.
        if permit_acquired {
            buffer.writer_sem().release();
        }
    };

    // Step 6: push the reader in overwrite mode if the writer has lapped it.
    if buffer.overwrite() {
        loop {
            let consumed_old = buffer.consumed().load(Ordering::Relaxed);
            let trunc_end = buffer.subbuf_trunc(offset_end.wrapping_sub(1));
            let trunc_consumed = buffer.subbuf_trunc(consumed_old);
            if !ge(trunc_end.wrapping_sub(trunc_consumed), buffer.alloc_size()) {
                break;
            }
            let consumed_new = buffer.subbuf_align(consumed_old);
            if buffer
                .consumed()
                .compare_exchange(consumed_old, consumed_new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if reserve_commit_diff != 0 {
                    let idx = buffer.subbuf_index(offset_begin);
                    buffer.commit_count(idx).fetch_add(reserve_commit_diff, Ordering::AcqRel);
                    buffer.record_corruption();
                    warn!("reserve: pushed reader past corrupted sub-buffer {}", idx);
                }
                break;
            }
            // Lost the consumed-cursor CAS race to another writer: retry.
        }
    }

    let freq_khz = clock.freq_khz();

    // Step 7: close the old sub-buffer.
    if end_switch_old {
        let last_byte = offset_old.wrapping_sub(1);
        let idx_old = buffer.subbuf_index(last_byte);
        let subbuf_base = buffer.subbuf_trunc(last_byte);
        let lost_size = buffer.subbuf_size() - (buffer.subbuf_offset(last_byte) + 1);
        // SAFETY: this sub-buffer's header region has already been written by
        // the writer that opened it; no one else may touch header bytes
        // until this closing writer finishes (I4).
        let header_bytes = unsafe { buffer.slot_mut(subbuf_base, BlockStart::ENCODED_LEN as u32) };
        BlockStart::patch_end(
            header_bytes,
            CycleMark {
                cycle_count: tsc,
                freq_khz,
            },
            lost_size,
        );

        let reserve_count = buffer
            .reserve_count(idx_old)
            .fetch_add(buffer.subbuf_offset(last_byte) + 1, Ordering::AcqRel)
            + (buffer.subbuf_offset(last_byte) + 1);
        if reserve_count == buffer.commit_count(idx_old).load(Ordering::Acquire) {
            buffer.deliver(idx_old);
        }
    }

    // Step 8: open the new sub-buffer.
    if begin_switch {
        let idx_new = buffer.subbuf_index(offset_begin);
        let subbuf_base = buffer.subbuf_trunc(offset_begin);
        let block_start = BlockStart {
            begin: CycleMark {
                cycle_count: tsc,
                freq_khz,
            },
            end: CycleMark::default(),
            lost_size: 0,
            buf_size: buffer.subbuf_size(),
            trace_header: TraceHeader::for_host(tsc),
        };
        // SAFETY: a fresh sub-buffer's header region has no other writer
        // until this generation's events are written into it.
        let header_bytes = unsafe { buffer.slot_mut(subbuf_base, BlockStart::ENCODED_LEN as u32) };
        block_start.encode(header_bytes);

        let commit_count = buffer
            .commit_count(idx_new)
            .fetch_add(SUBBUF_HEADER_LEN, Ordering::AcqRel)
            + SUBBUF_HEADER_LEN;
        if commit_count == buffer.reserve_count(idx_new).load(Ordering::Acquire) {
            buffer.deliver(idx_new);
        }
    }

    // Step 9: this reservation exactly fills out the sub-buffer it landed in.
    if buffer.subbuf_offset(offset_end) == 0 {
        let last_byte = offset_end.wrapping_sub(1);
        let idx_cur = buffer.subbuf_index(last_byte);
        let subbuf_base = buffer.subbuf_trunc(last_byte);
        let lost_size = buffer.subbuf_size() - (buffer.subbuf_offset(last_byte) + 1);
        // SAFETY: see step 7; this writer is the last one to touch this
        // generation of the sub-buffer it just filled.
        let header_bytes = unsafe { buffer.slot_mut(subbuf_base, BlockStart::ENCODED_LEN as u32) };
        BlockStart::patch_end(
            header_bytes,
            CycleMark {
                cycle_count: tsc,
                freq_khz,
            },
            lost_size,
        );

        let reserve_count = buffer
            .reserve_count(idx_cur)
            .fetch_add(buffer.subbuf_offset(last_byte) + 1, Ordering::AcqRel)
            + (buffer.subbuf_offset(last_byte) + 1);
        if reserve_count == buffer.commit_count(idx_cur).load(Ordering::Acquire) {
            buffer.deliver(idx_cur);
        }
    }

    Ok(SlotHandle {
        begin_offset: offset_begin,
        slot_size: size,
        tsc,
        header_pad_before,
        header_pad_after,
        header_size: EVENT_HEADER_RAW_LEN,
    })
}

/// Retires a reserved slot. Adds `handle.slot_size` to the owning
/// sub-buffer's commit count; if that now equals the reserve count, the
/// sub-buffer is delivered to the reader.
pub fn commit(buffer: &Buffer, handle: &SlotHandle) {
    let idx = buffer.subbuf_index(handle.begin_offset);
    let commit_count = buffer.commit_count(idx).fetch_add(handle.slot_size, Ordering::AcqRel) + handle.slot_size;
    if commit_count == buffer.reserve_count(idx).load(Ordering::Acquire) {
        buffer.deliver(idx);
    }
}
