use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Binary "something happened" flag the coordinator loop sleeps on.
///
/// Setting an already set signal is a no-op; the waiter clears it after waking.
#[derive(Default)]
pub struct ActivitySignal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl ActivitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Block until the signal is set or `timeout` elapses. Returns whether it is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                break;
            }
        }
        *set
    }
}
