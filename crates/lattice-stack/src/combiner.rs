//! Per-call serializing closure queue
//!
//! The call combiner guarantees that at most one closure manipulating a
//! call runs at any instant. It is not a mutex: the first submitter
//! acquires the combiner, runs its closure, and then drains whatever
//! other threads queued in the meantime. Later submitters enqueue and
//! return immediately.

use crossbeam_queue::SegQueue;
use lattice_core::closure::{Closure, StatusClosure};
use lattice_core::error::Status;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

enum CancelState {
    Idle,
    Pending(StatusClosure),
    Cancelled(Status),
}

/// Queue-based serializing lock for one call
pub struct CallCombiner {
    /// Closures in flight, including the one running
    size: AtomicUsize,
    queue: SegQueue<Closure>,
    cancel: Mutex<CancelState>,
}

impl Default for CallCombiner {
    fn default() -> Self {
        CallCombiner::new()
    }
}

impl CallCombiner {
    pub fn new() -> Self {
        CallCombiner {
            size: AtomicUsize::new(0),
            queue: SegQueue::new(),
            cancel: Mutex::new(CancelState::Idle),
        }
    }

    /// Run `closure` under the combiner
    ///
    /// If the combiner is free, the closure runs on the calling thread
    /// and the caller then drains any closures queued meanwhile.
    /// Otherwise the closure is queued for the current holder.
    pub fn start(&self, closure: Closure) {
        let prev = self.size.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            closure.run();
            self.drain();
        } else {
            self.queue.push(closure);
        }
    }

    fn drain(&self) {
        loop {
            let prev = self.size.fetch_sub(1, Ordering::AcqRel);
            if prev == 1 {
                return;
            }
            // Another submitter bumped size before its push became
            // visible; spin for the closure.
            loop {
                if let Some(closure) = self.queue.pop() {
                    closure.run();
                    break;
                }
                std::hint::spin_loop();
            }
        }
    }

    /// Register a callback to run if the call is cancelled
    ///
    /// A previously registered callback is released with `Ok(())`. If
    /// cancellation already happened the new callback runs immediately
    /// with the cancellation error.
    pub fn set_notify_on_cancel(&self, callback: StatusClosure) {
        let run_now = {
            let mut cancel = self.cancel.lock().unwrap();
            match std::mem::replace(&mut *cancel, CancelState::Idle) {
                CancelState::Cancelled(status) => {
                    *cancel = CancelState::Cancelled(status.clone());
                    Some((callback, Err(status)))
                }
                CancelState::Pending(old) => {
                    *cancel = CancelState::Pending(callback);
                    Some((old, Ok(())))
                }
                CancelState::Idle => {
                    *cancel = CancelState::Pending(callback);
                    None
                }
            }
        };
        if let Some((cb, result)) = run_now {
            cb.run(result);
        }
    }

    /// Record cancellation and fire the registered callback
    ///
    /// Later cancellations are ignored; the first error wins.
    pub fn cancel(&self, status: Status) {
        let pending = {
            let mut cancel = self.cancel.lock().unwrap();
            match std::mem::replace(&mut *cancel, CancelState::Cancelled(status.clone())) {
                CancelState::Cancelled(original) => {
                    *cancel = CancelState::Cancelled(original);
                    return;
                }
                CancelState::Pending(cb) => Some(cb),
                CancelState::Idle => None,
            }
        };
        if let Some(cb) = pending {
            cb.run(Err(status));
        }
    }
}
