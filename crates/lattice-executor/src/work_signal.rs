//! Work-available notification
//!
//! Idle workers park here with a backed-off timeout. Submission signals a
//! single waiter; shutdown and fork broadcast.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct WorkSignal {
    mu: Mutex<()>,
    cv: Condvar,
}

impl WorkSignal {
    pub fn new() -> Self {
        WorkSignal {
            mu: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Wake one parked worker
    pub fn signal(&self) {
        let _guard = self.mu.lock().unwrap();
        self.cv.notify_one();
    }

    /// Wake every parked worker
    pub fn signal_all(&self) {
        let _guard = self.mu.lock().unwrap();
        self.cv.notify_all();
    }

    /// Park until signalled or the timeout elapses; true if it timed out
    pub fn wait_with_timeout(&self, timeout: Duration) -> bool {
        let guard = self.mu.lock().unwrap();
        let (_guard, result) = self.cv.wait_timeout(guard, timeout).unwrap();
        result.timed_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_timeout_expires() {
        let s = WorkSignal::new();
        assert!(s.wait_with_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let s = Arc::new(WorkSignal::new());
        let s2 = s.clone();
        let h = thread::spawn(move || s2.wait_with_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        s.signal();
        // not timed out (unless the wait lost the race, which the sleep
        // above makes unlikely but not impossible; accept either way the
        // thread returns promptly)
        let _ = h.join().unwrap();
    }
}
