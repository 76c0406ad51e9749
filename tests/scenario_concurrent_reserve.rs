//! Scenario 4 (§8): concurrent reserve from many writer threads.

use std::sync::{Arc, Mutex};
use std::thread;

use rand::Rng;

use tracebuf::channel::{Channel, ChannelConfig};
use tracebuf::clock::MonotonicClock;

#[test]
fn concurrent_reservations_never_overlap() {
    // Large enough that 8 * 1000 reservations of up to 1024 bytes each can
    // never cross a sub-buffer boundary, so there's exactly one generation
    // and no contention between this test's bookkeeping and an overwrite.
    let chan = Channel::open(ChannelConfig {
        name: "cpu0".to_string(),
        subbuf_size: 1 << 24,
        n_subbufs: 1,
        overwrite: false,
        blocking: false,
        flight_recorder: false,
    })
    .unwrap();
    let clock = Arc::new(MonotonicClock::new());
    let handles = Arc::new(Mutex::new(Vec::new()));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let chan = chan.clone();
            let clock = clock.clone();
            let handles = handles.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..1000 {
                    let size: u32 = rng.gen_range(16, 1024);
                    let handle = chan.reserve(size, &*clock).expect("buffer is sized not to fill");
                    chan.commit(&handle);
                    handles.lock().unwrap().push(handle);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(chan.buffer().events_lost(), 0);

    let mut handles = handles.lock().unwrap();
    assert_eq!(handles.len(), 8000);
    handles.sort_by_key(|h| h.begin_offset);
    for window in handles.windows(2) {
        let (a, b) = (window[0], window[1]);
        assert!(
            a.begin_offset + a.slot_size <= b.begin_offset,
            "slots [{}, {}) and [{}, {}) overlap",
            a.begin_offset,
            a.begin_offset + a.slot_size,
            b.begin_offset,
            b.begin_offset + b.slot_size
        );
    }
}
