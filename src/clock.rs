//! The only clock used on the writer fast path: a monotonic cycle counter.
//!
//! Real TSC reads (`rdtsc`) require per-architecture inline asm; we derive a
//! synthetic cycle count from a monotonic [`std::time::Instant`] scaled by a
//! nominal frequency. This keeps the reservation protocol's arithmetic (which
//! only cares that the counter is monotonic and that zero means "unusable")
//! identical to a real TSC-backed implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A source of timestamps for event records.
///
/// `tsc()` returning `0` is the sentinel the reservation protocol treats as
/// "clock unusable" (see `ReserveError::ClockFault`); a real TSC essentially
/// never returns exactly zero, so the sentinel is safe to reuse here.
pub trait Clock: Send + Sync {
    /// Current cycle count. `0` means the clock is unusable right now.
    fn tsc(&self) -> u64;

    /// Nominal clock frequency in kHz, recorded in sub-buffer headers so a
    /// reader can convert cycle counts back to wall time.
    fn freq_khz(&self) -> u64;
}

/// A [`Clock`] backed by `Instant::now()`, scaled to look like a 1 GHz TSC.
pub struct MonotonicClock {
    origin: Instant,
}

const NOMINAL_FREQ_KHZ: u64 = 1_000_000;

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn tsc(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        // elapsed is always > 0 after the first call in practice, but guard
        // against a zero reading so we never accidentally synthesize a fault.
        let cycles = elapsed.as_nanos() as u64;
        if cycles == 0 {
            1
        } else {
            cycles
        }
    }

    fn freq_khz(&self) -> u64 {
        NOMINAL_FREQ_KHZ
    }
}

/// Test/fault-injection clock: returns `0` on a configurable fraction of calls.
///
/// Used by the clock-fault scenario in the test suite (every Nth call is a
/// fault, matching the "one in ten" framing of the testable-properties spec).
pub struct FaultyClock {
    inner: MonotonicClock,
    calls: AtomicU64,
    fault_every: u64,
}

impl FaultyClock {
    pub fn new(fault_every: u64) -> Self {
        assert!(fault_every > 0, "fault_every must be nonzero");
        FaultyClock {
            inner: MonotonicClock::new(),
            calls: AtomicU64::new(0),
            fault_every,
        }
    }
}

impl Clock for FaultyClock {
    fn tsc(&self) -> u64 {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.fault_every == 0 {
            0
        } else {
            self.inner.tsc()
        }
    }

    fn freq_khz(&self) -> u64 {
        self.inner.freq_khz()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_faults() {
        let clock = MonotonicClock::new();
        for _ in 0..1000 {
            assert_ne!(clock.tsc(), 0);
        }
    }

    #[test]
    fn faulty_clock_faults_on_schedule() {
        let clock = FaultyClock::new(10);
        let mut faults = 0;
        for _ in 0..100 {
            if clock.tsc() == 0 {
                faults += 1;
            }
        }
        assert_eq!(faults, 10);
    }
}
