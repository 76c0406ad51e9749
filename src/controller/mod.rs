//! Component H: the controller's in-process channel registry.
//!
//! Stands in for the kernel-resident channel tree a real LTTng controller
//! manages; `tracebufctl` (`src/bin/tracebufctl.rs`) drives this registry
//! from the CLI grammar in §6.

use std::collections::BTreeMap;
use std::sync::Arc;

use failure::Fail;
use log::info;

use crate::channel::{Channel, ChannelConfig};
use crate::error::ConfigError;

/// One named trace: a set of per-CPU channels sharing a root directory.
pub struct Trace {
    pub name: String,
    pub channel_root: String,
    /// Set by `--transport` at `create` time; this reimplementation only
    /// ever backs a trace with an in-process relay, so `"relay"` is the only
    /// value `create` accepts (§6).
    pub transport: String,
    channels: BTreeMap<String, Arc<Channel>>,
    running: bool,
}

/// The only transport this reimplementation knows how to back a trace with.
pub const DEFAULT_TRANSPORT: &str = "relay";

#[derive(Debug, Fail)]
pub enum ControllerError {
    #[fail(display = "trace {:?} already exists", _0)]
    TraceExists(String),
    #[fail(display = "no such trace {:?}", _0)]
    NoSuchTrace(String),
    #[fail(display = "trace {:?} is not running", _0)]
    NotRunning(String),
    #[fail(display = "trace {:?} is already running", _0)]
    AlreadyRunning(String),
    #[fail(display = "unsupported transport {:?}, only {:?} is backed by this daemon", _0, DEFAULT_TRANSPORT)]
    UnsupportedTransport(String),
    #[fail(display = "{}", _0)]
    Config(ConfigError),
}

impl From<ConfigError> for ControllerError {
    fn from(inner: ConfigError) -> Self {
        ControllerError::Config(inner)
    }
}

/// Per-channel options settable via `-o channel.<name>.<key>=<value>` (§6).
#[derive(Clone, Debug, Default)]
pub struct ChannelOptions {
    pub enable: Option<bool>,
    pub overwrite: Option<bool>,
    pub bufnum: Option<u32>,
    pub bufsize: Option<u32>,
}

const DEFAULT_SUBBUF_SIZE: u32 = 1 << 16;
const DEFAULT_N_SUBBUFS: u32 = 8;

/// Registry of traces known to one controller process.
#[derive(Default)]
pub struct ChannelRegistry {
    traces: BTreeMap<String, Trace>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry::default()
    }

    /// `create`: allocate a trace's channels without starting them.
    ///
    /// `transport` mirrors the original CLI's `--transport`, which must be
    /// combined with `create`/`create_start` (§6); this reimplementation has
    /// only one transport, so anything but [`DEFAULT_TRANSPORT`] is rejected.
    pub fn create(
        &mut self,
        trace_name: &str,
        channel_root: &str,
        transport: &str,
        per_channel: &BTreeMap<String, ChannelOptions>,
    ) -> Result<(), ControllerError> {
        if self.traces.contains_key(trace_name) {
            return Err(ControllerError::TraceExists(trace_name.to_string()));
        }
        if transport != DEFAULT_TRANSPORT {
            return Err(ControllerError::UnsupportedTransport(transport.to_string()));
        }

        let mut channels = BTreeMap::new();
        for (name, opts) in per_channel {
            if opts.enable == Some(false) {
                continue;
            }
            let config = ChannelConfig {
                name: name.clone(),
                subbuf_size: opts.bufsize.unwrap_or(DEFAULT_SUBBUF_SIZE),
                n_subbufs: opts.bufnum.unwrap_or(DEFAULT_N_SUBBUFS),
                overwrite: opts.overwrite.unwrap_or(false),
                blocking: false,
                flight_recorder: ChannelConfig::is_flight_recorder(name),
            };
            channels.insert(name.clone(), Channel::open(config)?);
        }

        info!("controller: created trace {:?} with {} channel(s)", trace_name, channels.len());
        self.traces.insert(
            trace_name.to_string(),
            Trace {
                name: trace_name.to_string(),
                channel_root: channel_root.to_string(),
                transport: transport.to_string(),
                channels,
                running: false,
            },
        );
        Ok(())
    }

    /// `destroy`: drop a trace and every channel in it.
    pub fn destroy(&mut self, trace_name: &str) -> Result<(), ControllerError> {
        self.traces
            .remove(trace_name)
            .map(|_| {
                info!("controller: destroyed trace {:?}", trace_name);
            })
            .ok_or_else(|| ControllerError::NoSuchTrace(trace_name.to_string()))
    }

    /// `start`: mark a trace as actively being written to / drained.
    pub fn start(&mut self, trace_name: &str) -> Result<(), ControllerError> {
        let trace = self.trace_mut(trace_name)?;
        if trace.running {
            return Err(ControllerError::AlreadyRunning(trace_name.to_string()));
        }
        trace.running = true;
        info!("controller: started trace {:?}", trace_name);
        Ok(())
    }

    /// `pause`: stop accepting new writes without tearing channels down.
    pub fn pause(&mut self, trace_name: &str) -> Result<(), ControllerError> {
        let trace = self.trace_mut(trace_name)?;
        if !trace.running {
            return Err(ControllerError::NotRunning(trace_name.to_string()));
        }
        trace.running = false;
        info!("controller: paused trace {:?}", trace_name);
        Ok(())
    }

    /// `create_start`: the `create` + `start` shortcut.
    pub fn create_start(
        &mut self,
        trace_name: &str,
        channel_root: &str,
        transport: &str,
        per_channel: &BTreeMap<String, ChannelOptions>,
    ) -> Result<(), ControllerError> {
        self.create(trace_name, channel_root, transport, per_channel)?;
        self.start(trace_name)
    }

    /// `pause_destroy`: the `pause` + `destroy` shortcut.
    pub fn pause_destroy(&mut self, trace_name: &str) -> Result<(), ControllerError> {
        let _ = self.pause(trace_name);
        self.destroy(trace_name)
    }

    pub fn trace(&self, trace_name: &str) -> Result<&Trace, ControllerError> {
        self.traces
            .get(trace_name)
            .ok_or_else(|| ControllerError::NoSuchTrace(trace_name.to_string()))
    }

    fn trace_mut(&mut self, trace_name: &str) -> Result<&mut Trace, ControllerError> {
        self.traces
            .get_mut(trace_name)
            .ok_or_else(|| ControllerError::NoSuchTrace(trace_name.to_string()))
    }
}

impl Trace {
    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Parses a `name=value` option string into a boolean, accepting the
/// `y/n/1/0` forms the controller CLI grammar allows (§6).
pub fn parse_bool_option(value: &str) -> Option<bool> {
    match value {
        "y" | "1" => Some(true),
        "n" | "0" => Some(false),
        _ => None,
    }
}
