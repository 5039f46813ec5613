//! Single-assignment rendezvous cell
//!
//! One producer sets the value exactly once; one consumer polls for it.
//! A waiter registered before the value arrives is woken by `set`. The
//! promise pipeline uses a latch to hand server initial metadata to the
//! filter that asked to observe it.

use crate::closure::Closure;
use std::sync::Mutex;

enum LatchState<T> {
    Empty,
    EmptyWithWaiter(Closure),
    Set(T),
    Taken,
}

/// One-producer one-consumer single-assignment cell
pub struct Latch<T> {
    state: Mutex<LatchState<T>>,
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Latch::new()
    }
}

impl<T> Latch<T> {
    pub fn new() -> Self {
        Latch {
            state: Mutex::new(LatchState::Empty),
        }
    }

    /// Assign the value; wakes a registered waiter
    ///
    /// Panics if the latch was already set: the cell is single-assignment.
    pub fn set(&self, value: T) {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, LatchState::Set(value)) {
                LatchState::Empty => None,
                LatchState::EmptyWithWaiter(w) => Some(w),
                LatchState::Set(_) | LatchState::Taken => {
                    panic!("Latch::set called twice")
                }
            }
        };
        if let Some(w) = waiter {
            w.run();
        }
    }

    /// Take the value if it has been set; None while pending or after taken
    pub fn poll(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            LatchState::Set(_) => match std::mem::replace(&mut *state, LatchState::Taken) {
                LatchState::Set(v) => Some(v),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    /// Register a waiter to run when the value arrives
    ///
    /// If the value is already present the waiter runs immediately on the
    /// calling thread. At most one waiter may be pending at a time.
    pub fn on_set(&self, waiter: Closure) {
        let run_now = {
            let mut state = self.state.lock().unwrap();
            match &*state {
                LatchState::Empty => {
                    *state = LatchState::EmptyWithWaiter(waiter);
                    return;
                }
                LatchState::EmptyWithWaiter(_) => {
                    panic!("Latch::on_set: waiter already registered")
                }
                LatchState::Set(_) | LatchState::Taken => waiter,
            }
        };
        run_now.run();
    }

    pub fn is_set(&self) -> bool {
        matches!(*self.state.lock().unwrap(), LatchState::Set(_))
    }
}
