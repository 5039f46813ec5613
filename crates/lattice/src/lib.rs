//! # lattice
//!
//! The execution substrate of a high-performance RPC runtime: the pieces
//! that decide when and on which resources user work runs, and how byte
//! streams traverse a chain of transformation stages.
//!
//! Three subsystems:
//!
//! - a **work-stealing thread pool** mapping submitted closures onto a
//!   bounded, self-tuning set of OS threads, with per-thread local
//!   queues, cross-thread stealing, fork survival, and graceful
//!   quiescence ([`WorkStealingPool`]);
//! - its per-thread **work queues**, offering cheap LIFO access to the
//!   owning thread and FIFO access to stealers ([`WorkQueue`]);
//! - the **filter stack and promise-based call pipeline**: composable
//!   channel stacks instantiated per connection, call stacks per RPC,
//!   and a per-call promise polled inside a serializing call combiner
//!   that yields the server's trailing metadata ([`StackBuilder`],
//!   [`CallStack`], [`ClientPromiseFilter`]).
//!
//! ## Quick start
//!
//! ```ignore
//! use lattice::{PoolConfig, WorkStealingPool};
//!
//! let pool = WorkStealingPool::new(PoolConfig::default());
//! pool.run(|| println!("hello from a pool thread"));
//! pool.quiesce();
//! ```

// Re-export core types
pub use lattice_core::{
    Arena, ArenaBox, ArgValue, Backoff, ChannelArgs, Closure, CoreResult, Latch, Notification,
    SpinLock, Status, StatusClosure, StatusCode,
};

// Re-export logging macros and utilities
pub use lattice_core::tracelog::{self, LogLevel};
pub use lattice_core::{env, tlog_debug, tlog_error, tlog_info, tlog_trace, tlog_warn};

// Re-export the executor
pub use lattice_executor::{forkable, PoolConfig, WorkQueue, WorkStealingPool};

// Re-export the filter stack and call pipeline
pub use lattice_stack::{
    lame, Activity, Batch, CallArgs, CallCombiner, CallElem, CallPromise, CallPromiseArgs,
    CallStack, ChannelElemRef, ChannelInfo, ChannelStack, ChannelStackArgs, ClientPromiseFilter,
    Endpoint, Filter, Metadata, NextPromiseFactory, Poll, PollingEntity, PostProcessorSlot,
    Promise, PromiseFilter, ServerPromiseFilter, StackBuilder, Transport, TransportFilter,
    TransportOp, Waker,
};
