//! Small synchronization helpers shared by the work pool and the pipeline.

use parking_lot::{Condvar, Mutex};

/// A manual-reset event.
///
/// `set` wakes every current and future waiter until `reset` is called.
/// Used for worker wakeups and fan-out completion signalling.
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal the event, releasing all waiters.
    pub fn set(&self) {
        let mut s = self.signaled.lock();
        *s = true;
        self.cond.notify_all();
    }

    /// Return the event to the non-signaled state.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Block until the event is signaled.
    pub fn wait(&self) {
        let mut s = self.signaled.lock();
        while !*s {
            self.cond.wait(&mut s);
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_releases_waiter() {
        let ev = Arc::new(Event::new());
        let ev2 = Arc::clone(&ev);
        let t = std::thread::spawn(move || ev2.wait());
        ev.set();
        t.join().unwrap();
    }

    #[test]
    fn wait_after_set_returns_immediately() {
        let ev = Event::new();
        ev.set();
        ev.wait();
        ev.reset();
        ev.set();
        ev.wait();
    }
}
