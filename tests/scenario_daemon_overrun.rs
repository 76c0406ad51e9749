//! Scenario 5 (§8): daemon resumes after a writer overran a reader that had
//! fallen behind.

use std::thread;
use std::time::Duration;

use tracebuf::channel::{Channel, ChannelConfig};
use tracebuf::clock::MonotonicClock;
use tracebuf::daemon::{self, DaemonConfig};
use tracebuf::error::DeliveryError;

#[test]
fn daemon_keeps_draining_after_an_overrun() {
    let dir = tempfile::tempdir().unwrap();
    let chan = Channel::open(ChannelConfig {
        name: "cpu0".to_string(),
        subbuf_size: 256,
        n_subbufs: 4,
        overwrite: true,
        blocking: false,
        flight_recorder: false,
    })
    .unwrap();
    let clock = MonotonicClock::new();

    // Simulate the daemon having fallen behind: claim one sub-buffer without
    // releasing it, then keep writing until the writer has lapped the reader
    // (in overwrite mode) and pushed `consumed` out from under the claim.
    let mut stale = None;
    for _ in 0..2000 {
        if let Ok(h) = chan.reserve(32, &clock) {
            chan.commit(&h);
        }
        if stale.is_none() {
            stale = chan.get_subbuf().ok();
        }
    }
    let stale = stale.expect("expected a deliverable sub-buffer within 2000 reservations");

    assert!(
        chan.buffer().corrupted_subbuffers() >= 1,
        "writer should have lapped the stalled reader at least once"
    );
    assert!(matches!(
        chan.put_subbuf(stale),
        Err(DeliveryError::PushedByWriter)
    ));

    // Now let the daemon take over: despite the earlier overrun, it should
    // still drain whatever is currently deliverable.
    let daemon = daemon::run(
        vec![chan],
        DaemonConfig {
            trace_dir: dir.path().to_path_buf(),
            channel_root: dir.path().to_path_buf(),
            worker_threads: 1,
            append: false,
            flight_only: false,
            normal_only: false,
        },
    )
    .unwrap();

    thread::sleep(Duration::from_millis(100));
    daemon.shutdown();
    daemon.join();

    let written = std::fs::metadata(dir.path().join("cpu0")).unwrap();
    assert!(written.len() > 0, "daemon should have written at least one sub-buffer after resuming");
}
