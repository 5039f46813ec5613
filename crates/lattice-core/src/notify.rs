//! One-shot cross-thread notification
//!
//! A `Notification` latches once notified; every current and future waiter
//! is released. Startup/shutdown coordination between the pool, its
//! workers, and the lifeguard runs on these.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A one-shot event that releases all waiters once notified
#[derive(Debug, Default)]
pub struct Notification {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Notification {
            notified: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Latch the notification and wake all waiters
    pub fn notify(&self) {
        let mut notified = self.notified.lock().unwrap();
        *notified = true;
        self.cv.notify_all();
    }

    /// Block until notified
    pub fn wait(&self) {
        let mut notified = self.notified.lock().unwrap();
        while !*notified {
            notified = self.cv.wait(notified).unwrap();
        }
    }

    /// Block until notified or the timeout elapses; true if notified
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut notified = self.notified.lock().unwrap();
        while !*notified {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(notified, deadline - now).unwrap();
            notified = guard;
        }
        true
    }

    pub fn has_been_notified(&self) -> bool {
        *self.notified.lock().unwrap()
    }
}
