//! Component F: the channel registry & control surface.
//!
//! A real LTTng channel is a kernel relayfs file the daemon `ioctl`s and
//! `mmap`s; there is no such device here, so `Channel` exposes the same four
//! control operations (§6) as plain methods over an in-process [`Buffer`].

use std::sync::Arc;

use log::debug;

use crate::buffer::Buffer;
use crate::clock::Clock;
use crate::delivery::{self, ReadHandle};
use crate::error::{ConfigError, DeliveryError, ReserveError};
use crate::event::EventHeader;
use crate::reserve::{self, SlotHandle};

/// Static configuration a channel was opened with (§4.D, §6).
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub name: String,
    pub subbuf_size: u32,
    pub n_subbufs: u32,
    pub overwrite: bool,
    pub blocking: bool,
    /// Channels named `flight-*` are only ever drained at teardown and
    /// always run in overwrite mode (§4.D "Flight-recorder vs normal").
    pub flight_recorder: bool,
}

impl ChannelConfig {
    pub fn is_flight_recorder(name: &str) -> bool {
        name.starts_with("flight-")
    }
}

/// One writer/reader channel: a [`Buffer`] plus the config it was opened
/// with. Multiple channels (one per CPU, conventionally) make up a trace.
pub struct Channel {
    config: ChannelConfig,
    buffer: Buffer,
}

impl Channel {
    pub fn open(config: ChannelConfig) -> Result<Arc<Self>, ConfigError> {
        let overwrite = config.overwrite || config.flight_recorder;
        let name = config.name.clone();
        let buffer = Buffer::new(
            config.subbuf_size,
            config.n_subbufs,
            overwrite,
            config.blocking,
            Box::new(move |idx| {
                debug!("channel {}: sub-buffer {} delivered", name, idx);
            }),
        )?;
        Ok(Arc::new(Channel {
            config: ChannelConfig { overwrite, ..config },
            buffer,
        }))
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Writer-facing: reserve `data_size` bytes for one event.
    pub fn reserve(&self, data_size: u32, clock: &dyn Clock) -> Result<SlotHandle, ReserveError> {
        reserve::reserve(&self.buffer, data_size, clock)
    }

    /// Writer-facing: retire a slot obtained from [`Channel::reserve`].
    pub fn commit(&self, handle: &SlotHandle) {
        reserve::commit(&self.buffer, handle)
    }

    /// Writes an event header and its payload into a slot obtained from
    /// [`Channel::reserve`] (the step the reservation protocol leaves to the
    /// caller). Must be called before [`Channel::commit`].
    ///
    /// Panics if `payload` doesn't fit the reserved slot; a correct caller
    /// reserved `payload.len()` bytes of `data_size`, so this only fires on
    /// caller error.
    pub fn write_event(&self, handle: &SlotHandle, header: EventHeader, payload: &[u8]) {
        let header_offset = handle.begin_offset + handle.header_pad_before;
        // SAFETY: `handle` was just returned by this channel's `reserve`;
        // per I4, no one else touches these bytes until `commit` closes it.
        let header_bytes = unsafe { self.buffer.slot_mut(header_offset, handle.header_size) };
        header.encode(header_bytes);

        let payload_offset = header_offset + handle.header_size + handle.header_pad_after;
        let fixed = handle.header_pad_before + handle.header_size + handle.header_pad_after;
        assert!(
            payload.len() as u32 <= handle.slot_size - fixed,
            "payload of {} bytes does not fit the reserved slot",
            payload.len()
        );
        // SAFETY: see above.
        let payload_bytes = unsafe { self.buffer.slot_mut(payload_offset, payload.len() as u32) };
        payload_bytes.copy_from_slice(payload);
    }

    /// `GET_SUBBUF`: the oldest readable sub-buffer, if any.
    pub fn get_subbuf(&self) -> Result<ReadHandle, DeliveryError> {
        delivery::get_next_subbuf(&self.buffer)
    }

    /// `PUT_SUBBUF`: release a sub-buffer claimed with [`Channel::get_subbuf`].
    pub fn put_subbuf(&self, handle: ReadHandle) -> Result<(), DeliveryError> {
        delivery::put_subbuf(&self.buffer, handle)
    }

    /// `GET_N_SUBBUFS`: channel geometry.
    pub fn get_n_subbufs(&self) -> u32 {
        self.buffer.n_subbufs()
    }

    /// `GET_SUBBUF_SIZE`: channel geometry.
    pub fn get_subbuf_size(&self) -> u32 {
        self.buffer.subbuf_size()
    }

    /// Raw bytes of one sub-buffer, for the daemon to write to its trace file.
    ///
    /// Sound to call once `get_subbuf` has returned a handle for `index`: I3
    /// guarantees no writer still holds an uncommitted slot in it.
    pub fn subbuf_bytes(&self, index: usize) -> &[u8] {
        let start = index as u32 * self.buffer.subbuf_size();
        // SAFETY: caller holds a `ReadHandle` for this index, so per I3/I4 no
        // writer will touch these bytes until this reader releases it.
        unsafe { self.buffer.slot(start, self.buffer.subbuf_size()) }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Rough count of closed-but-undrained sub-buffers, used by the daemon
    /// to classify a channel as high or normal poll priority (§4.D).
    pub fn pending_subbufs(&self) -> u32 {
        self.buffer.pending_subbufs()
    }
}
