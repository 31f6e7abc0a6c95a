//! Background worker plumbing.
//!
//! Each worker owns a pending bit and a condvar: signalling an already
//! pending trigger coalesces, so re-queuing a worker that has not run yet is
//! a no-op, and a signal that arrives while the worker runs re-arms it for
//! another pass.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct TriggerState {
    pending: bool,
    stop: bool,
}

/// Coalescing wake-up for one background worker.
#[derive(Default)]
pub(crate) struct Trigger {
    state: Mutex<TriggerState>,
    cv: Condvar,
}

impl Trigger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm the worker. Idempotent while a pass is already pending.
    pub(crate) fn signal(&self) {
        let mut state = self.state.lock();
        if state.stop {
            return;
        }
        state.pending = true;
        drop(state);
        self.cv.notify_one();
    }

    /// Block until armed or stopped. Returns `false` on shutdown.
    pub(crate) fn wait_next(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stop {
                return false;
            }
            if state.pending {
                state.pending = false;
                return true;
            }
            self.cv.wait(&mut state);
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.stop = true;
        drop(state);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn signals_coalesce() {
        let t = Trigger::new();
        t.signal();
        t.signal();
        assert!(t.wait_next());
        // both signals collapsed into one pass
        t.shutdown();
        assert!(!t.wait_next());
    }

    #[test]
    fn worker_loop_runs_per_signal() {
        let t = Arc::new(Trigger::new());
        let passes = Arc::new(AtomicUsize::new(0));

        let t2 = Arc::clone(&t);
        let passes2 = Arc::clone(&passes);
        let handle = std::thread::spawn(move || {
            while t2.wait_next() {
                passes2.fetch_add(1, Ordering::AcqRel);
            }
        });

        t.signal();
        while passes.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
        t.signal();
        while passes.load(Ordering::Acquire) < 2 {
            std::thread::yield_now();
        }
        t.shutdown();
        handle.join().expect("worker join");
        assert!(passes.load(Ordering::Acquire) >= 2);
    }
}
