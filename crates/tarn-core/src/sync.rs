//! Counting barrier for checkpoint acknowledgment
//!
//! A requester increments the barrier once per participating thread, then
//! blocks until every target has passed it at its own safe point. The
//! count can go negative transiently when a target passes before the
//! requester finishes incrementing; waiting is on the count reaching zero.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Counting barrier
#[derive(Debug, Default)]
pub struct Barrier {
    count: Mutex<i64>,
    cond: Condvar,
}

impl Barrier {
    /// Create a barrier with an initial count
    pub fn new(initial: i64) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Add pending acknowledgments
    pub fn increment(&self, n: i64) {
        let mut count = self.count.lock();
        *count += n;
        if *count <= 0 {
            self.cond.notify_all();
        }
    }

    /// Acknowledge: called by a target after running its checkpoint
    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count <= 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every pending acknowledgment has arrived
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Block with a deadline; false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_for(&mut count, timeout).timed_out() {
                return *count <= 0;
            }
        }
        true
    }

    /// Current count (diagnostics)
    pub fn count(&self) -> i64 {
        *self.count.lock()
    }
}
