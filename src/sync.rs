//! Blocking-writer primitives.
//!
//! §5 calls for a counting semaphore (`writer_sem`) used only on the
//! blocking-writer path, with the reader's wait-then-CAS masked against
//! signal delivery. This is a pure user-space reimplementation with no
//! kernel signal delivery to mask, so per §9's escape hatch ("implementations
//! without signals... may replace this with a condition variable") the
//! semaphore is built on a `Mutex`/`Condvar` pair, and "masking signals
//! around the wait" is modeled by a `suppress_notify` flag checked before
//! `Condvar::notify_one` fires.

use std::sync::{Condvar, Mutex};

/// A counting semaphore initialized to `n_subbufs`, acquired by a writer
/// switching into a freshly closed sub-buffer and released by the reader
/// after draining one.
pub struct Semaphore {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    permits: usize,
    /// Set while the reader's wait-then-CAS sequence must not be woken;
    /// models "mask all signals around the wait, restoring on success or
    /// failure" without a real signal to mask.
    notify_suppressed: bool,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            state: Mutex::new(State {
                permits,
                notify_suppressed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then consumes it.
    pub fn acquire(&self) {
        let mut state = self.state.lock().unwrap();
        while state.permits == 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.permits -= 1;
    }

    /// Returns a permit to the pool, waking one waiter unless notifications
    /// are currently suppressed.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.permits += 1;
        if !state.notify_suppressed {
            self.cond.notify_one();
        }
    }

    /// Disables wakeups for the duration of `f`, mirroring the masked-signal
    /// wait-and-CAS sequence described in §5/§9.
    pub fn with_notifications_suppressed<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut state = self.state.lock().unwrap();
            state.notify_suppressed = true;
        }
        let result = f();
        {
            let mut state = self.state.lock().unwrap();
            state.notify_suppressed = false;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_release_round_trips() {
        let sem = Semaphore::new(1);
        sem.acquire();
        sem.release();
        sem.acquire();
    }

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.acquire();
        });
        thread::sleep(Duration::from_millis(20));
        sem.release();
        handle.join().unwrap();
    }
}
