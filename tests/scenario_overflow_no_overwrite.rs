//! Scenario 2 (§8): overflow without overwrite.

use tracebuf::channel::{Channel, ChannelConfig};
use tracebuf::clock::MonotonicClock;

#[test]
fn non_overwrite_channel_drops_events_once_full() {
    let chan = Channel::open(ChannelConfig {
        name: "cpu0".to_string(),
        subbuf_size: 256,
        n_subbufs: 2,
        overwrite: false,
        blocking: false,
        flight_recorder: false,
    })
    .unwrap();
    let clock = MonotonicClock::new();

    let mut lost = 0u64;
    for _ in 0..200 {
        if chan.reserve(64, &clock).is_err() {
            lost += 1;
        }
        // Nothing ever drains the channel, so eventually every reservation
        // past the 512-byte allocation fails with TransientFull.
    }

    assert!(lost > 0, "expected at least some reservations to be dropped");
    assert_eq!(chan.buffer().events_lost(), lost);
}
