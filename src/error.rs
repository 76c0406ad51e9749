//! Error kinds for the reservation, delivery, and daemon subsystems.
//!
//! Mirrors the teacher crate's approach: one `#[derive(Fail)]` enum per
//! subsystem, composed with `From` impls rather than a single god-enum.

use std::io;

use failure::Fail;

/// Errors raised while constructing a [`crate::buffer::Buffer`].
#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "subbuf_size ({}) must be a power of two", _0)]
    SubbufSizeNotPowerOfTwo(u32),
    #[fail(display = "n_subbufs ({}) must be a power of two", _0)]
    NSubbufsNotPowerOfTwo(u32),
    #[fail(display = "subbuf_size ({}) must be at least the sub-buffer header length ({})", _0, _1)]
    SubbufTooSmall(u32, u32),
    #[fail(display = "subbuf_size * n_subbufs overflows a 32-bit address space")]
    AllocSizeOverflow,
    #[fail(display = "failed to allocate the ring buffer's backing memory")]
    AllocationFailed,
}

/// Errors returned by [`crate::reserve::reserve`].
///
/// These are all non-fatal: the caller drops the event and keeps going.
#[derive(Debug, Fail)]
pub enum ReserveError {
    #[fail(display = "clock source returned a sentinel value, event dropped")]
    ClockFault,
    #[fail(display = "event of {} bytes is larger than one sub-buffer ({} bytes)", _0, _1)]
    Oversize(u32, u32),
    #[fail(display = "no sub-buffer available and the channel is not in overwrite mode")]
    TransientFull,
}

/// Errors surfaced by the reader-facing half of the commit/delivery engine.
#[derive(Debug, Fail)]
pub enum DeliveryError {
    #[fail(display = "no sub-buffer is currently ready for the reader")]
    NotReady,
    #[fail(
        display = "sub-buffer was overwritten by a writer while the reader held it (overrun)"
    )]
    PushedByWriter,
    #[fail(display = "read handle does not correspond to the channel's current consumed cursor")]
    InvalidHandle,
}

/// Errors at the daemon/control-surface boundary, where configuration and
/// I/O failures are allowed to be fatal (unlike the writer/reader fast paths).
#[derive(Debug, Fail)]
pub enum DaemonError {
    #[fail(display = "{}", _0)]
    Config(ConfigError),
    #[fail(display = "I/O error talking to a channel or trace file: {}", _0)]
    Io(io::Error),
    #[fail(display = "channel geometry error: {}", _0)]
    Delivery(DeliveryError),
    #[fail(display = "invalid command-line arguments: {}", _0)]
    BadArgs(String),
}

impl From<ConfigError> for DaemonError {
    fn from(inner: ConfigError) -> Self {
        DaemonError::Config(inner)
    }
}

impl From<io::Error> for DaemonError {
    fn from(inner: io::Error) -> Self {
        DaemonError::Io(inner)
    }
}

impl From<DeliveryError> for DaemonError {
    fn from(inner: DeliveryError) -> Self {
        DaemonError::Delivery(inner)
    }
}
