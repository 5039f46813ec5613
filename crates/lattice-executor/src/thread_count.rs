//! Pool thread accounting
//!
//! Two counters with opposite access profiles: `BusyThreadCount` is
//! incremented and decremented around every closure, so it shards across
//! cache-line-padded atomics and pays a slower sum on read;
//! `LivingThreadCount` changes only when threads start or exit, so it sits
//! behind a mutex and offers a condition-variable wait used by quiesce and
//! fork.

use lattice_core::tlog_info;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Rate at which "waiting for ..." progress lines print while blocked
const BLOCKED_WAIT_LOG_RATE: Duration = Duration::from_secs(3);

#[repr(align(64))]
struct Shard {
    count: AtomicUsize,
}

/// Sharded count of threads currently executing a closure
pub struct BusyThreadCount {
    shards: Box<[Shard]>,
    next_idx: AtomicUsize,
}

impl Default for BusyThreadCount {
    fn default() -> Self {
        BusyThreadCount::new()
    }
}

impl BusyThreadCount {
    pub fn new() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(4);
        let shards = (0..n)
            .map(|_| Shard {
                count: AtomicUsize::new(0),
            })
            .collect();
        BusyThreadCount {
            shards,
            next_idx: AtomicUsize::new(0),
        }
    }

    /// A valid shard index, rotated per call to spread contention
    pub fn next_index(&self) -> usize {
        self.next_idx.fetch_add(1, Ordering::Relaxed) % self.shards.len()
    }

    pub fn increment(&self, idx: usize) {
        self.shards[idx].count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self, idx: usize) {
        self.shards[idx].count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Sum over all shards; slower than increment/decrement
    pub fn count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.count.load(Ordering::Relaxed))
            .sum()
    }

    /// RAII increment for the duration of a closure run
    pub fn guard(&self, idx: usize) -> BusyGuard<'_> {
        self.increment(idx);
        BusyGuard { counter: self, idx }
    }
}

/// Decrements its shard when dropped
pub struct BusyGuard<'a> {
    counter: &'a BusyThreadCount,
    idx: usize,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.counter.decrement(self.idx);
    }
}

/// Count of living worker threads, waitable
#[derive(Default)]
pub struct LivingThreadCount {
    count: Mutex<usize>,
    cv: Condvar,
}

impl LivingThreadCount {
    pub fn new() -> Self {
        LivingThreadCount {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn increment(&self) {
        *self.count.lock().unwrap() += 1;
        self.cv.notify_all();
    }

    pub fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        debug_assert!(*count > 0);
        *count -= 1;
        self.cv.notify_all();
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }

    /// Block until the count drops to `desired`
    ///
    /// With a timeout, returns false if the deadline passes first.
    /// Progress is logged every few seconds so a stuck shutdown is
    /// diagnosable.
    pub fn block_until(&self, desired: usize, timeout: Option<Duration>, why: &str) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut last_log = Instant::now();
        let mut count = self.count.lock().unwrap();
        while *count > desired {
            let now = Instant::now();
            if let Some(d) = deadline {
                if now >= d {
                    return false;
                }
            }
            let mut wait = BLOCKED_WAIT_LOG_RATE;
            if let Some(d) = deadline {
                wait = wait.min(d - now);
            }
            let (guard, _) = self.cv.wait_timeout(count, wait).unwrap();
            count = guard;
            if last_log.elapsed() >= BLOCKED_WAIT_LOG_RATE {
                tlog_info!(
                    "waiting for {} living threads while {} ({} still running)",
                    desired,
                    why,
                    *count
                );
                last_log = Instant::now();
            }
        }
        true
    }
}
