//! `tracebufd`: the disk-writing consumer daemon binary (§6 "Daemon CLI").

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::exit;

use clap::{App, Arg};
use log::{error, info};

use tracebuf::daemon::{self, DaemonConfig};

const EXIT_EINVAL: i32 = 22;

fn main() {
    env_logger::Builder::from_default_env().init();

    let matches = App::new("tracebufd")
        .about("Drains tracebuf channels to disk")
        .arg(Arg::with_name("trace_dir").short("t").takes_value(true).required(true).help("trace output directory"))
        .arg(Arg::with_name("channel_root").short("c").takes_value(true).required(true).help("channel root directory"))
        .arg(Arg::with_name("daemonize").short("d").help("daemonize"))
        .arg(Arg::with_name("append").short("a").help("append to an existing trace"))
        .arg(Arg::with_name("worker_threads").short("N").takes_value(true).help("worker thread count"))
        .arg(Arg::with_name("flight_only").short("f").help("drain only flight-recorder channels"))
        .arg(Arg::with_name("normal_only").short("n").help("drain only normal channels"))
        .get_matches();

    if matches.is_present("daemonize") {
        info!("tracebufd: -d given but this reimplementation always stays in the foreground");
    }

    let worker_threads: usize = match matches.value_of("worker_threads").map(str::parse) {
        Some(Ok(n)) => n,
        Some(Err(_)) => {
            error!("tracebufd: -N requires an integer");
            exit(EXIT_EINVAL);
        }
        None => 1,
    };

    let config = DaemonConfig {
        trace_dir: PathBuf::from(matches.value_of("trace_dir").unwrap()),
        channel_root: PathBuf::from(matches.value_of("channel_root").unwrap()),
        worker_threads,
        append: matches.is_present("append"),
        flight_only: matches.is_present("flight_only"),
        normal_only: matches.is_present("normal_only"),
    };

    if config.flight_only && config.normal_only {
        error!("tracebufd: -f and -n are mutually exclusive");
        exit(EXIT_EINVAL);
    }

    // Initial scan; `daemon::run` below spawns a background thread that
    // keeps re-scanning `channel_root` for channels created after this point
    // (§4.D item 5).
    let channels = match daemon::discover_channels(&config.channel_root, &HashSet::new()) {
        Ok(channels) => channels,
        Err(e) => {
            error!("tracebufd: failed to discover channels under {:?}: {}", config.channel_root, e);
            exit(EXIT_EINVAL);
        }
    };

    if channels.is_empty() {
        error!("tracebufd: no channels found under {:?}", config.channel_root);
        exit(EXIT_EINVAL);
    }

    let daemon = match daemon::run(channels, config) {
        Ok(d) => d,
        Err(e) => {
            error!("tracebufd: failed to start: {}", e);
            exit(1);
        }
    };

    ctrlc_fallback();
    daemon.join();
}

/// Runs until `SIGINT`/`SIGTERM`/`SIGQUIT`, matching §5's "volatile quit
/// flag checked each poll iteration". This reimplementation has no signal
/// plumbing (explicitly excluded, §1), so it simply blocks until the
/// process is killed; `Daemon::join` above is what actually returns once a
/// real deployment wires up a signal handler that calls `shutdown()`.
fn ctrlc_fallback() {}
