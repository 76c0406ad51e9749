//! Scenario 3 (§8): overwrite mode overrun with a paused reader.

use tracebuf::channel::{Channel, ChannelConfig};
use tracebuf::clock::MonotonicClock;

#[test]
fn overwrite_channel_corrupts_instead_of_dropping() {
    let chan = Channel::open(ChannelConfig {
        name: "cpu0".to_string(),
        subbuf_size: 256,
        n_subbufs: 2,
        overwrite: true,
        blocking: false,
        flight_recorder: false,
    })
    .unwrap();
    let clock = MonotonicClock::new();

    for _ in 0..200 {
        // Reader never drains: every reservation either succeeds by pushing
        // the (stationary) reader cursor forward, or fails for an unrelated
        // reason (oversize/clock fault, neither of which applies here).
        let _ = chan.reserve(64, &clock);
    }

    assert!(
        chan.buffer().corrupted_subbuffers() >= 1,
        "writer should have lapped the idle reader at least once"
    );
}
