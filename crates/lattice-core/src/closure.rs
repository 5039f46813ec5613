//! One-shot runnable units
//!
//! A [`Closure`] is the unit of work submitted to the executor and queued
//! inside call combiners. It runs at most once per submission; re-entrant
//! submission of new closures from inside `run` is allowed.

use crate::error::CoreResult;
use core::fmt;

/// A one-shot callback with no arguments
pub struct Closure {
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl Closure {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Closure { f: Box::new(f) }
    }

    /// Consume and run the closure
    pub fn run(self) {
        (self.f)();
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closure")
    }
}

/// A one-shot callback receiving the outcome of an operation
///
/// Batch completion callbacks and combiner cancel notifications use this
/// flavor: the producer reports `Ok(())` or the error that terminated the
/// operation.
pub struct StatusClosure {
    f: Box<dyn FnOnce(CoreResult<()>) + Send + 'static>,
}

impl StatusClosure {
    pub fn new(f: impl FnOnce(CoreResult<()>) + Send + 'static) -> Self {
        StatusClosure { f: Box::new(f) }
    }

    /// Consume and run with the operation outcome
    pub fn run(self, result: CoreResult<()>) {
        (self.f)(result);
    }
}

impl fmt::Debug for StatusClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StatusClosure")
    }
}
