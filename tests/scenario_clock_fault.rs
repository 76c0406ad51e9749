//! Scenario 6 (§8): clock source intermittently returns 0.

use tracebuf::channel::{Channel, ChannelConfig};
use tracebuf::clock::FaultyClock;
use tracebuf::header::BlockStart;

#[test]
fn clock_faults_are_counted_and_never_written_to_a_header() {
    let chan = Channel::open(ChannelConfig {
        name: "cpu0".to_string(),
        subbuf_size: 1 << 16,
        n_subbufs: 2,
        overwrite: false,
        blocking: false,
        flight_recorder: false,
    })
    .unwrap();
    // Every 10th call returns 0; with 100 single-threaded reserve() calls
    // (one clock read each, no CAS contention) that's exactly 10 faults.
    let clock = FaultyClock::new(10);

    for _ in 0..100 {
        if let Ok(handle) = chan.reserve(32, &clock) {
            chan.commit(&handle);
        }
    }

    assert_eq!(chan.buffer().events_lost(), 10);

    // The first reservation always forces the mandatory initial sub-buffer
    // switch and is never itself the faulting call (attempt 1 of 10), so
    // sub-buffer 0's header carries a real, nonzero cycle count.
    let subbuf = chan.subbuf_bytes(0);
    let block_start = BlockStart::decode(&subbuf[..BlockStart::ENCODED_LEN]);
    assert_ne!(block_start.begin.cycle_count, 0);
}
