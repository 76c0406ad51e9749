//! Scenario 1 (§8): single writer, single sub-buffer.

use tracebuf::channel::{Channel, ChannelConfig};
use tracebuf::clock::Clock;
use tracebuf::event::EventHeader;
use tracebuf::header::BlockStart;

/// A clock that returns a caller-supplied sequence of TSCs, so the test can
/// assert on `begin.cycle_count` exactly.
struct ScriptedClock {
    values: std::sync::Mutex<std::vec::IntoIter<u64>>,
}

impl ScriptedClock {
    fn new(values: Vec<u64>) -> Self {
        ScriptedClock {
            values: std::sync::Mutex::new(values.into_iter()),
        }
    }
}

impl Clock for ScriptedClock {
    fn tsc(&self) -> u64 {
        self.values.lock().unwrap().next().unwrap_or(0)
    }

    fn freq_khz(&self) -> u64 {
        1_000_000
    }
}

#[test]
fn single_writer_single_subbuf_round_trips() {
    let chan = Channel::open(ChannelConfig {
        name: "cpu0".to_string(),
        subbuf_size: 4096,
        n_subbufs: 2,
        overwrite: false,
        blocking: false,
        flight_recorder: false,
    })
    .unwrap();

    let tscs: Vec<u64> = (0..10).map(|t| 100 + t).collect(); // T0..T9
    let clock = ScriptedClock::new(tscs.clone());

    let payload = vec![0xABu8; 100];
    let mut handles = Vec::new();
    for t in &tscs {
        let handle = chan.reserve(100, &clock).expect("reserve should succeed");
        let header = EventHeader {
            timestamp: *t,
            facility_id: 0,
            event_id: 0,
            event_size: EventHeader::clamp_size(payload.len()),
        };
        chan.write_event(&handle, header, &payload);
        chan.commit(&handle);
        handles.push(handle);
    }

    assert_eq!(chan.buffer().events_lost(), 0);

    // All ten events fit in one sub-buffer; the writer never closed it out,
    // so it won't be deliverable yet, but its header was written at open
    // time with begin.cycle_count == T0 (the first reserve's clock reading,
    // which forced the mandatory initial boundary switch).
    let subbuf = chan.subbuf_bytes(0);
    let block_start = BlockStart::decode(&subbuf[..BlockStart::ENCODED_LEN]);
    assert_eq!(block_start.begin.cycle_count, tscs[0]);

    // Walk the event records back out via each reservation's own offsets
    // (slot placement includes pointer-alignment padding that varies per
    // reservation, so it can't be recomputed from a fixed stride).
    for (t, handle) in tscs.iter().zip(&handles) {
        let header_at = (handle.begin_offset + handle.header_pad_before) as usize;
        let header = EventHeader::decode(&subbuf[header_at..]);
        assert_eq!(header.timestamp, *t);
        assert_eq!(header.event_size as usize, payload.len());

        let payload_at = header_at + handle.header_size as usize + handle.header_pad_after as usize;
        assert_eq!(&subbuf[payload_at..payload_at + payload.len()], payload.as_slice());
    }
}
