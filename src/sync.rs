//! Reset-count events.
//!
//! The staging area parks producers on two named events: one for the batch
//! region, one for the single region. A waiter captures the event's signal
//! count *while still holding the staging mutex*, releases the mutex, and
//! only then blocks. If a signal lands in between, the stored count no
//! longer matches and the wait returns immediately. This is the classic
//! capture-before-unlock protocol that keeps the drop-lock-then-wait retry
//! loops free of lost wakeups.

use parking_lot::{Condvar, Mutex};

/// A broadcast event with a monotonically increasing signal count.
pub(crate) struct Event {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Captures the current signal count. Call while holding the lock that
    /// guards the awaited condition.
    pub(crate) fn reset(&self) -> u64 {
        *self.count.lock()
    }

    /// Wakes every waiter whose captured count predates this signal.
    pub(crate) fn set(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_all();
    }

    /// Blocks until the signal count moves past `captured`.
    pub(crate) fn wait_low(&self, captured: u64) {
        let mut count = self.count.lock();
        while *count == captured {
            self.cond.wait(&mut count);
        }
    }
}
