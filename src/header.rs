//! Wire-visible sub-buffer and trace headers (§3, §6).
//!
//! Every field here is part of the on-disk format: byte order, field order,
//! and width are fixed. Encoding/decoding is hand-rolled with
//! `to_le_bytes`/`from_le_bytes` rather than a derive macro, since the layout
//! has to match bit-for-bit regardless of the host's native endianness.

use std::convert::TryInto;

pub const TRACE_MAGIC: u32 = 0x00D6_1D01;
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// `begin`/`end` cycle-count + frequency pair embedded in [`BlockStart`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleMark {
    pub cycle_count: u64,
    pub freq_khz: u64,
}

impl CycleMark {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.cycle_count.to_le_bytes());
        out[8..16].copy_from_slice(&self.freq_khz.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Self {
        CycleMark {
            cycle_count: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            freq_khz: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

/// Per-trace header embedded at the start of every sub-buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceHeader {
    pub magic: u32,
    pub major: u8,
    pub minor: u8,
    /// `sizeof(void*)` on the writer, so a reader can detect a 32/64-bit mismatch.
    pub arch_size: u8,
    /// `1` for little-endian writers, `0` for big-endian.
    pub little_endian: u8,
    pub start_sec: u64,
    pub start_usec: u64,
    pub start_tsc: u64,
    /// Whether event payloads are pointer-aligned in this trace.
    pub alignment: u8,
}

impl TraceHeader {
    pub const ENCODED_LEN: usize = 4 + 1 + 1 + 1 + 1 + 8 + 8 + 8 + 1;

    pub fn for_host(start_tsc: u64) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        TraceHeader {
            magic: TRACE_MAGIC,
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            arch_size: std::mem::size_of::<usize>() as u8,
            little_endian: if cfg!(target_endian = "little") { 1 } else { 0 },
            start_sec: now.as_secs(),
            start_usec: now.subsec_micros() as u64,
            start_tsc,
            alignment: 1,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::ENCODED_LEN);
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4] = self.major;
        out[5] = self.minor;
        out[6] = self.arch_size;
        out[7] = self.little_endian;
        out[8..16].copy_from_slice(&self.start_sec.to_le_bytes());
        out[16..24].copy_from_slice(&self.start_usec.to_le_bytes());
        out[24..32].copy_from_slice(&self.start_tsc.to_le_bytes());
        out[32] = self.alignment;
    }

    pub fn decode(bytes: &[u8]) -> Self {
        TraceHeader {
            magic: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            major: bytes[4],
            minor: bytes[5],
            arch_size: bytes[6],
            little_endian: bytes[7],
            start_sec: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            start_usec: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            start_tsc: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            alignment: bytes[32],
        }
    }

    /// Whether a reader on this host can safely interpret a trace written
    /// with this header (arch width and endianness must match).
    pub fn matches_host(&self) -> bool {
        self.arch_size as usize == std::mem::size_of::<usize>()
            && self.little_endian == (cfg!(target_endian = "little") as u8)
    }
}

/// Header written at the start of every sub-buffer (§3 `BlockStart`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockStart {
    pub begin: CycleMark,
    pub end: CycleMark,
    pub lost_size: u32,
    pub buf_size: u32,
    pub trace_header: TraceHeader,
}

impl BlockStart {
    pub const ENCODED_LEN: usize =
        CycleMark::ENCODED_LEN * 2 + 4 + 4 + TraceHeader::ENCODED_LEN;

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::ENCODED_LEN);
        self.begin.encode(&mut out[0..16]);
        self.end.encode(&mut out[16..32]);
        out[32..36].copy_from_slice(&self.lost_size.to_le_bytes());
        out[36..40].copy_from_slice(&self.buf_size.to_le_bytes());
        self.trace_header
            .encode(&mut out[40..40 + TraceHeader::ENCODED_LEN]);
    }

    pub fn decode(bytes: &[u8]) -> Self {
        BlockStart {
            begin: CycleMark::decode(&bytes[0..16]),
            end: CycleMark::decode(&bytes[16..32]),
            lost_size: u32::from_le_bytes(bytes[32..36].try_into().unwrap()),
            buf_size: u32::from_le_bytes(bytes[36..40].try_into().unwrap()),
            trace_header: TraceHeader::decode(&bytes[40..40 + TraceHeader::ENCODED_LEN]),
        }
    }

    /// Patches only the `end`/`lost_size` fields of an already-written
    /// header, leaving `begin`/`buf_size`/`trace_header` untouched. Used when
    /// a sub-buffer closes: the writer that opened it already wrote the full
    /// header, and the writer that closes it only knows the tail end.
    pub fn patch_end(out: &mut [u8], end: CycleMark, lost_size: u32) {
        debug_assert!(out.len() >= Self::ENCODED_LEN);
        end.encode(&mut out[16..32]);
        out[32..36].copy_from_slice(&lost_size.to_le_bytes());
    }
}

/// Fixed length of the header written at the start of each sub-buffer.
/// The reservation engine reserves exactly this many bytes before the first
/// event record of a freshly opened sub-buffer.
pub const SUBBUF_HEADER_LEN: u32 = BlockStart::ENCODED_LEN as u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_header_round_trips() {
        let h = TraceHeader::for_host(12345);
        let mut buf = [0u8; TraceHeader::ENCODED_LEN];
        h.encode(&mut buf);
        assert_eq!(TraceHeader::decode(&buf), h);
    }

    #[test]
    fn block_start_round_trips() {
        let b = BlockStart {
            begin: CycleMark {
                cycle_count: 10,
                freq_khz: 1_000_000,
            },
            end: CycleMark {
                cycle_count: 20,
                freq_khz: 1_000_000,
            },
            lost_size: 42,
            buf_size: 4096,
            trace_header: TraceHeader::for_host(10),
        };
        let mut buf = vec![0u8; BlockStart::ENCODED_LEN];
        b.encode(&mut buf);
        assert_eq!(BlockStart::decode(&buf), b);
    }

    #[test]
    fn host_trace_header_matches_host() {
        assert!(TraceHeader::for_host(1).matches_host());
    }
}
