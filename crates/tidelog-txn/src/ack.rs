//! Commit acknowledgment countdown.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default, Clone, Copy)]
struct Count {
    required: u32,
    remaining: u32,
}

/// Countdown latch a committing transaction waits on until every required
/// acknowledgment (local durability, replicas) has arrived.
#[derive(Debug, Default)]
pub struct AckLatch {
    count: Mutex<Count>,
    released: Condvar,
}

impl AckLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `required` acknowledgments from now on.
    pub fn arm(&self, required: u32) {
        *self.count.lock() = Count {
            required,
            remaining: required,
        };
    }

    /// One acknowledgment arrived. Extra calls are ignored.
    pub fn countdown(&self) {
        let mut count = self.count.lock();
        if count.remaining == 0 {
            return;
        }
        count.remaining -= 1;
        if count.remaining == 0 {
            self.released.notify_all();
        }
    }

    #[must_use]
    pub fn required(&self) -> u32 {
        self.count.lock().required
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.count.lock().remaining
    }

    /// Wait until the count reaches zero. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while count.remaining > 0 {
            if self.released.wait_until(&mut count, deadline).timed_out() {
                return count.remaining == 0;
            }
        }
        true
    }
}
