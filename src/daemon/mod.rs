//! Component G: the disk-writing consumer daemon (§4.D).
//!
//! Drives the four control operations against a set of channels, writing
//! deliverable sub-buffers to per-channel trace files. `tracebufd`
//! (`src/bin/tracebufd.rs`) is the CLI wrapper around [`run`].

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::channel::{Channel, ChannelConfig};
use crate::error::{DaemonError, DeliveryError};

/// Mirrors the daemon CLI table in §6.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub trace_dir: PathBuf,
    pub channel_root: PathBuf,
    pub worker_threads: usize,
    pub append: bool,
    pub flight_only: bool,
    pub normal_only: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            trace_dir: PathBuf::from("."),
            channel_root: PathBuf::from("."),
            worker_threads: 1,
            append: false,
            flight_only: false,
            normal_only: false,
        }
    }
}

struct ChannelSlot {
    channel: Arc<Channel>,
    /// Doubles as the "per-pair mutex, acquired with try-lock" §5 calls for
    /// and as the trace file handle itself.
    file: Mutex<File>,
}

const SHUTDOWN_TOKEN: Token = Token(0);
const SWEEP_INTERVAL: Duration = Duration::from_millis(20);
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

/// A worker's view of its channel set: shared and mutable so the discovery
/// thread can append newly found channels while workers keep sweeping.
type Shard = Arc<Mutex<Vec<Arc<ChannelSlot>>>>;

/// Default geometry given to channels this daemon discovers on its own,
/// matching what `tracebufd`'s initial scan used before this module took
/// over the discovery side (§4.D item 5).
const DISCOVERED_SUBBUF_SIZE: u32 = 1 << 16;
const DISCOVERED_N_SUBBUFS: u32 = 8;

/// A running daemon. Dropping this without calling [`Daemon::shutdown`]
/// leaves its worker threads running until the process exits.
pub struct Daemon {
    shutdown: Arc<AtomicBool>,
    wakeups: Vec<SetReadiness>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl Daemon {
    /// Signals every worker to stop after its current sweep and wakes any
    /// worker currently parked in `poll`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for wakeup in &self.wakeups {
            let _ = wakeup.set_readiness(Ready::readable());
        }
    }

    /// Blocks until every worker has finished its teardown sweep. Safe to
    /// call once; a second call is a no-op.
    pub fn join(&self) {
        if let Some(workers) = self.workers.lock().unwrap().take() {
            for worker in workers {
                let _ = worker.join();
            }
        }
    }
}

fn trace_file_path(trace_dir: &Path, channel_name: &str) -> PathBuf {
    trace_dir.join(channel_name)
}

fn open_trace_file(trace_dir: &Path, channel_name: &str, append: bool) -> std::io::Result<File> {
    std::fs::create_dir_all(trace_dir)?;
    OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(trace_file_path(trace_dir, channel_name))
}

/// Starts the daemon over `channels`, returning a [`Daemon`] handle used to
/// request shutdown and wait for it.
///
/// Partitions `channels` round-robin across `config.worker_threads` worker
/// threads, each sweeping its shard once per [`SWEEP_INTERVAL`] (or sooner,
/// if woken by [`Daemon::shutdown`]): high-priority channels (more than half
/// their sub-buffers backed up) are drained fully before any normal-priority
/// channel gets a turn, per §4.D. Flight-recorder channels are skipped
/// during normal sweeps and drained only in the final teardown pass, unless
/// `-f`/`-n` narrowed the daemon to one class.
///
/// A background discovery thread also re-scans `config.channel_root` every
/// [`RESCAN_INTERVAL`] and appends any newly-created sub-channel it finds to
/// the least-loaded worker's shard (§4.D item 5: the channel set is not
/// fixed at startup).
pub fn run(channels: Vec<Arc<Channel>>, config: DaemonConfig) -> Result<Daemon, DaemonError> {
    let known: HashSet<String> = channels.iter().map(|c| c.name().to_string()).collect();
    let slots: Vec<Arc<ChannelSlot>> = channels
        .into_iter()
        .map(|channel| -> Result<_, DaemonError> {
            let file = open_trace_file(&config.trace_dir, channel.name(), config.append)?;
            Ok(Arc::new(ChannelSlot {
                channel,
                file: Mutex::new(file),
            }))
        })
        .collect::<Result<_, _>>()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let n_workers = config.worker_threads.max(1);
    let shards = shard(&slots, n_workers);

    info!(
        "daemon: starting {} worker(s) over {} channel(s)",
        n_workers,
        slots.len()
    );

    let mut wakeups = Vec::with_capacity(n_workers + 1);
    let mut workers = Vec::with_capacity(n_workers + 1);
    for shard in shards.iter().cloned() {
        let (registration, set_readiness) = Registration::new2();
        wakeups.push(set_readiness);
        let shutdown = shutdown.clone();
        let config = config.clone();
        workers.push(thread::spawn(move || {
            worker_loop(shard, &config, &shutdown, registration);
        }));
    }

    {
        let (registration, set_readiness) = Registration::new2();
        wakeups.push(set_readiness);
        let shutdown = shutdown.clone();
        let config = config.clone();
        workers.push(thread::spawn(move || {
            discovery_loop(shards, &config, &shutdown, registration, known);
        }));
    }

    Ok(Daemon {
        shutdown,
        wakeups,
        workers: Mutex::new(Some(workers)),
    })
}

fn shard(slots: &[Arc<ChannelSlot>], n_workers: usize) -> Vec<Shard> {
    let mut shards = vec![Vec::new(); n_workers];
    for (i, slot) in slots.iter().enumerate() {
        shards[i % n_workers].push(slot.clone());
    }
    shards.into_iter().map(|s| Arc::new(Mutex::new(s))).collect()
}

/// Lists the sub-channel directories under `channel_root`, skipping any
/// name already in `known`. Mirrors the one-time scan `tracebufd` used to do
/// on its own; now shared between that initial scan and this module's
/// periodic re-scan.
pub fn discover_channels(channel_root: &Path, known: &HashSet<String>) -> std::io::Result<Vec<Arc<Channel>>> {
    let mut channels = Vec::new();
    if !channel_root.exists() {
        return Ok(channels);
    }
    for entry in std::fs::read_dir(channel_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if known.contains(&name) {
            continue;
        }
        let config = ChannelConfig {
            flight_recorder: ChannelConfig::is_flight_recorder(&name),
            name,
            subbuf_size: DISCOVERED_SUBBUF_SIZE,
            n_subbufs: DISCOVERED_N_SUBBUFS,
            overwrite: false,
            blocking: false,
        };
        match Channel::open(config) {
            Ok(channel) => channels.push(channel),
            Err(e) => warn!("daemon: skipping malformed channel: {}", e),
        }
    }
    Ok(channels)
}

fn discovery_loop(
    shards: Vec<Shard>,
    config: &DaemonConfig,
    shutdown: &AtomicBool,
    registration: Registration,
    mut known: HashSet<String>,
) {
    let poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            warn!("daemon: failed to create a poll instance, discovery thread exiting: {}", e);
            return;
        }
    };
    if let Err(e) = poll.register(&registration, SHUTDOWN_TOKEN, Ready::readable(), PollOpt::edge()) {
        warn!("daemon: failed to register shutdown wakeup: {}", e);
    }
    let mut events = Events::with_capacity(4);
    let mut next_shard = 0usize;

    while !shutdown.load(Ordering::SeqCst) {
        let _ = poll.poll(&mut events, Some(RESCAN_INTERVAL));
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let found = match discover_channels(&config.channel_root, &known) {
            Ok(found) => found,
            Err(e) => {
                warn!("daemon: re-scan of {:?} failed: {}", config.channel_root, e);
                continue;
            }
        };
        for channel in found {
            let file = match open_trace_file(&config.trace_dir, channel.name(), config.append) {
                Ok(file) => file,
                Err(e) => {
                    warn!("daemon: failed to open trace file for newly discovered channel {:?}: {}", channel.name(), e);
                    continue;
                }
            };
            known.insert(channel.name().to_string());
            info!("daemon: discovered new channel {:?}", channel.name());
            let slot = Arc::new(ChannelSlot {
                channel,
                file: Mutex::new(file),
            });
            shards[next_shard % shards.len()].lock().unwrap().push(slot);
            next_shard = next_shard.wrapping_add(1);
        }
    }
}

fn worker_loop(shard: Shard, config: &DaemonConfig, shutdown: &AtomicBool, registration: Registration) {
    let poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            warn!("daemon: failed to create a poll instance, worker exiting: {}", e);
            return;
        }
    };
    if let Err(e) = poll.register(&registration, SHUTDOWN_TOKEN, Ready::readable(), PollOpt::edge()) {
        warn!("daemon: failed to register shutdown wakeup: {}", e);
    }
    let mut events = Events::with_capacity(4);

    while !shutdown.load(Ordering::SeqCst) {
        let snapshot: Vec<Arc<ChannelSlot>> = shard.lock().unwrap().clone();
        sweep(&snapshot, config, false);
        let _ = poll.poll(&mut events, Some(SWEEP_INTERVAL));
    }
    // Teardown: drain everything once, including flight-recorder channels.
    let snapshot: Vec<Arc<ChannelSlot>> = shard.lock().unwrap().clone();
    sweep(&snapshot, config, true);
}

fn sweep(shard: &[Arc<ChannelSlot>], config: &DaemonConfig, teardown: bool) {
    let (high, normal): (Vec<_>, Vec<_>) = shard.iter().partition(|slot| is_high_priority(slot));

    for slot in high.iter().chain(normal.iter()) {
        if !should_drain(slot, config, teardown) {
            continue;
        }
        // Keep draining a single channel while it stays backed up, mirroring
        // "services all high-priority fds before any normal-priority fd".
        while drain_once(slot) && is_high_priority(slot) {}
    }
}

fn is_high_priority(slot: &ChannelSlot) -> bool {
    let n = slot.channel.get_n_subbufs();
    slot.channel.pending_subbufs() * 2 >= n
}

fn should_drain(slot: &ChannelSlot, config: &DaemonConfig, teardown: bool) -> bool {
    let flight = slot.channel.config().flight_recorder;
    if config.flight_only {
        flight
    } else if config.normal_only {
        !flight
    } else if flight {
        teardown
    } else {
        true
    }
}

/// One get/write/put cycle. Returns whether a sub-buffer was actually
/// drained (used to decide whether to keep draining a hot channel).
fn drain_once(slot: &ChannelSlot) -> bool {
    let file = match slot.file.try_lock() {
        Ok(file) => file,
        Err(_) => {
            debug!("daemon: channel {:?} contended, skipping this sweep", slot.channel.name());
            return false;
        }
    };
    drain_locked(slot, file)
}

fn drain_locked(slot: &ChannelSlot, mut file: std::sync::MutexGuard<File>) -> bool {
    let handle = match slot.channel.get_subbuf() {
        Ok(handle) => handle,
        Err(DeliveryError::NotReady) => return false,
        Err(other) => {
            warn!("daemon: unexpected error draining {:?}: {}", slot.channel.name(), other);
            return false;
        }
    };

    let bytes = slot.channel.subbuf_bytes(handle.index);
    if let Err(e) = file.write_all(bytes) {
        warn!("daemon: I/O error writing channel {:?}: {}", slot.channel.name(), e);
        // An I/O failure doesn't entitle us to hold the reader side open
        // (§7: IOFailure is logged, not fatal).
    }

    match slot.channel.put_subbuf(handle) {
        Ok(()) => true,
        Err(DeliveryError::PushedByWriter) => {
            warn!(
                "daemon: overrun on channel {:?}: writer overwrote sub-buffer {} before it was released",
                slot.channel.name(),
                handle.index
            );
            // Keep the corrupted frame already written above rather than
            // truncate the trace file (documented open-question decision).
            true
        }
        Err(other) => {
            warn!("daemon: put_subbuf failed for {:?}: {}", slot.channel.name(), other);
            false
        }
    }
}
