//! Hybrid most-recent-slot / deque work queue
//!
//! Each pool thread owns one of these as its inbox, and one more serves as
//! the pool's global queue. The newest insertion lives in a dedicated
//! single-element slot behind a spinlock, so the owner's LIFO fast path
//! touches one cache-hot element; older closures overflow into a
//! mutex-guarded deque that stealers drain FIFO. Both pop paths use
//! try-lock so contended peers give up instead of blocking.
//!
//! Enqueue timestamps for the slot and the oldest body element are
//! published in atomics, letting backpressure heuristics assess staleness
//! without taking either lock.

use lattice_core::clock;
use lattice_core::closure::Closure;
use lattice_core::spin::SpinLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Published when the corresponding position is empty; reads as
/// "infinite past" for staleness checks
pub const INVALID_TIMESTAMP: i64 = -1;

struct Timed {
    closure: Closure,
    enqueued_ns: i64,
}

/// A per-thread closure inbox
///
/// Invariants:
/// - if the body is nonempty, its oldest timestamp is strictly earlier
///   than the most-recent slot's timestamp
/// - a closure leaves the queue exactly once
pub struct WorkQueue {
    most_recent: SpinLock<Option<Timed>>,
    most_recent_ts: AtomicI64,
    body: Mutex<VecDeque<Timed>>,
    oldest_ts: AtomicI64,
}

impl Default for WorkQueue {
    fn default() -> Self {
        WorkQueue::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue {
            most_recent: SpinLock::new(None),
            most_recent_ts: AtomicI64::new(INVALID_TIMESTAMP),
            body: Mutex::new(VecDeque::new()),
            oldest_ts: AtomicI64::new(INVALID_TIMESTAMP),
        }
    }

    /// Publish `closure` as the new most-recent element
    ///
    /// A previously-held most-recent element is demoted to the tail of
    /// the body.
    pub fn add(&self, closure: Closure) {
        let item = Timed {
            closure,
            enqueued_ns: clock::monotonic_nanos(),
        };
        let displaced = {
            let mut slot = self.most_recent.lock();
            let prev_ts = self
                .most_recent_ts
                .swap(item.enqueued_ns, Ordering::Relaxed);
            match slot.replace(item) {
                Some(prev) if prev_ts != INVALID_TIMESTAMP => prev,
                _ => return,
            }
        };
        let mut body = self.body.lock().unwrap();
        if body.is_empty() {
            self.oldest_ts
                .store(displaced.enqueued_ns, Ordering::Relaxed);
        }
        body.push_back(displaced);
    }

    /// Consume the newest element: slot first, then the body's tail
    ///
    /// May return `None` under contention even when nonempty; peers never
    /// block each other on this path.
    pub fn pop_most_recent(&self) -> Option<Closure> {
        if self.most_recent_ts.load(Ordering::Relaxed) != INVALID_TIMESTAMP {
            if let Some(c) = self.try_pop_slot() {
                return Some(c);
            }
        }
        if self.oldest_ts.load(Ordering::Relaxed) != INVALID_TIMESTAMP {
            if let Some(c) = self.try_lock_and_pop(false) {
                return Some(c);
            }
        }
        None
    }

    /// Consume the oldest element: body's head first, then the slot
    pub fn pop_oldest(&self) -> Option<Closure> {
        if self.oldest_ts.load(Ordering::Relaxed) != INVALID_TIMESTAMP {
            if let Some(c) = self.try_lock_and_pop(true) {
                return Some(c);
            }
        }
        if self.most_recent_ts.load(Ordering::Relaxed) != INVALID_TIMESTAMP {
            if let Some(c) = self.try_pop_slot() {
                return Some(c);
            }
        }
        None
    }

    fn try_pop_slot(&self) -> Option<Closure> {
        let mut slot = self.most_recent.try_lock()?;
        let item = slot.take()?;
        self.most_recent_ts
            .store(INVALID_TIMESTAMP, Ordering::Relaxed);
        Some(item.closure)
    }

    fn try_lock_and_pop(&self, oldest: bool) -> Option<Closure> {
        let mut body = self.body.try_lock().ok()?;
        self.pop_body_locked(&mut body, oldest)
    }

    fn pop_body_locked(
        &self,
        body: &mut VecDeque<Timed>,
        oldest: bool,
    ) -> Option<Closure> {
        if body.is_empty() {
            if self.most_recent_ts.load(Ordering::Relaxed) == INVALID_TIMESTAMP {
                return None;
            }
            return self.try_pop_slot();
        }
        let item = if oldest {
            body.pop_front()
        } else {
            body.pop_back()
        }?;
        if body.is_empty() {
            self.oldest_ts.store(INVALID_TIMESTAMP, Ordering::Relaxed);
        } else if oldest {
            if let Some(front) = body.front() {
                self.oldest_ts.store(front.enqueued_ns, Ordering::Relaxed);
            }
        }
        Some(item.closure)
    }

    /// Lock-free emptiness check from the published timestamps
    pub fn is_empty(&self) -> bool {
        self.most_recent_ts.load(Ordering::Relaxed) == INVALID_TIMESTAMP
            && self.oldest_ts.load(Ordering::Relaxed) == INVALID_TIMESTAMP
    }

    pub fn len(&self) -> usize {
        let body_len = self.body.lock().unwrap().len();
        body_len + usize::from(self.most_recent_ts.load(Ordering::Relaxed) != INVALID_TIMESTAMP)
    }

    /// Enqueue time of the stalest element, or [`INVALID_TIMESTAMP`] when
    /// empty
    pub fn oldest_enqueued_timestamp(&self) -> i64 {
        let oldest = self.oldest_ts.load(Ordering::Relaxed);
        if oldest != INVALID_TIMESTAMP {
            return oldest;
        }
        self.most_recent_ts.load(Ordering::Relaxed)
    }
}
