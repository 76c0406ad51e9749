//! `tracebufctl`: the controller CLI binary (§6 "Controller CLI").

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::exit;

use clap::{App, Arg, SubCommand};
use log::error;

use tracebuf::controller::{parse_bool_option, ChannelOptions, ChannelRegistry, DEFAULT_TRANSPORT};
use tracebuf::daemon::{self, DaemonConfig};

const EXIT_EINVAL: i32 = 22;

fn command_app<'a, 'b>(name: &'b str) -> App<'a, 'b> {
    App::new(name).arg(Arg::with_name("trace_name").required(true))
}

fn main() {
    env_logger::Builder::from_default_env().init();

    let matches = App::new("tracebufctl")
        .about("Controls tracebuf channels")
        .subcommand(command_app("create").arg(option_arg()).arg(channel_root_arg()))
        .subcommand(command_app("destroy"))
        .subcommand(command_app("start"))
        .subcommand(command_app("pause"))
        .subcommand(command_app("create_start").arg(option_arg()).arg(channel_root_arg()))
        .subcommand(command_app("pause_destroy"))
        .arg(
            Arg::with_name("transport")
                .long("transport")
                .takes_value(true)
                .help("transport to create the trace with (only \"relay\" is supported); must combine with create/create_start"),
        )
        .arg(
            Arg::with_name("write")
                .long("write")
                .short("w")
                .takes_value(true)
                .help("path to drain the trace to; must combine with create/create_start"),
        )
        .get_matches();

    let mut registry = ChannelRegistry::new();

    let (subcommand, sub_matches) = match matches.subcommand() {
        (name, Some(sub)) if !name.is_empty() => (name, sub),
        _ => {
            error!("tracebufctl: a subcommand is required (create|destroy|start|pause|create_start|pause_destroy)");
            exit(EXIT_EINVAL);
        }
    };

    let creating = subcommand == "create" || subcommand == "create_start";
    if matches.value_of("transport").is_some() && !creating {
        error!("tracebufctl: --transport must be combined with create or create_start");
        exit(EXIT_EINVAL);
    }
    if matches.value_of("write").is_some() && !creating {
        error!("tracebufctl: --write must be combined with create or create_start");
        exit(EXIT_EINVAL);
    }
    let transport = matches.value_of("transport").unwrap_or(DEFAULT_TRANSPORT);

    let trace_name = sub_matches.value_of("trace_name").unwrap();
    let channel_root = sub_matches.value_of("channel_root").unwrap_or(".");
    let per_channel = parse_channel_options(sub_matches.values_of("option"));

    let result = match subcommand {
        "create" => registry.create(trace_name, channel_root, transport, &per_channel).map_err(|e| e.to_string()),
        "destroy" => registry.destroy(trace_name).map_err(|e| e.to_string()),
        "start" => registry.start(trace_name).map_err(|e| e.to_string()),
        "pause" => registry.pause(trace_name).map_err(|e| e.to_string()),
        "create_start" => registry
            .create_start(trace_name, channel_root, transport, &per_channel)
            .map_err(|e| e.to_string()),
        "pause_destroy" => registry.pause_destroy(trace_name).map_err(|e| e.to_string()),
        other => Err(format!("unknown subcommand {:?}", other)),
    };

    if let Err(e) = result {
        error!("tracebufctl: {}", e);
        exit(EXIT_EINVAL);
    }

    if let Some(write_path) = matches.value_of("write") {
        spawn_write_daemon(&registry, trace_name, channel_root, write_path);
    }
}

/// `-w/--write PATH`: in the original this forks an `lttd` process pointed
/// at `PATH`; here the controller and daemon share one process, so it just
/// calls [`daemon::run`] directly over the trace's own channels and blocks
/// until the daemon is told to stop (`SIGINT`/`SIGTERM`, per the daemon's own
/// foreground-only model).
fn spawn_write_daemon(registry: &ChannelRegistry, trace_name: &str, channel_root: &str, write_path: &str) {
    let trace = match registry.trace(trace_name) {
        Ok(trace) => trace,
        Err(e) => {
            error!("tracebufctl: --write: {}", e);
            exit(EXIT_EINVAL);
        }
    };
    let channels = trace.channels().cloned().collect();
    let config = DaemonConfig {
        trace_dir: PathBuf::from(write_path),
        channel_root: PathBuf::from(channel_root),
        worker_threads: 1,
        append: false,
        flight_only: false,
        normal_only: false,
    };
    match daemon::run(channels, config) {
        Ok(d) => d.join(),
        Err(e) => {
            error!("tracebufctl: --write: failed to start daemon: {}", e);
            exit(1);
        }
    }
}

fn option_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("option")
        .short("o")
        .takes_value(true)
        .multiple(true)
        .number_of_values(1)
        .help("channel.<name>.{enable,overwrite,bufnum,bufsize}=value")
}

fn channel_root_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("channel_root").long("channel_root").takes_value(true)
}

/// Parses `-o channel.<name>.<key>=<value>` options into per-channel config.
fn parse_channel_options<'a>(values: Option<clap::Values<'a>>) -> BTreeMap<String, ChannelOptions> {
    let mut per_channel: BTreeMap<String, ChannelOptions> = BTreeMap::new();
    for raw in values.into_iter().flatten() {
        let (path, value) = match raw.find('=') {
            Some(pos) => (&raw[..pos], &raw[pos + 1..]),
            None => {
                error!("tracebufctl: malformed option {:?}, expected name=value", raw);
                continue;
            }
        };
        let mut parts = path.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("channel"), Some(name), Some(key)) => {
                let opts = per_channel.entry(name.to_string()).or_insert_with(ChannelOptions::default);
                match key {
                    "enable" => opts.enable = parse_bool_option(value),
                    "overwrite" => opts.overwrite = parse_bool_option(value),
                    "bufnum" => opts.bufnum = value.parse().ok(),
                    "bufsize" => opts.bufsize = value.parse().ok(),
                    other => error!("tracebufctl: unknown channel option {:?}", other),
                }
            }
            _ => error!("tracebufctl: malformed option path {:?}, expected channel.<name>.<key>", path),
        }
    }
    per_channel
}
