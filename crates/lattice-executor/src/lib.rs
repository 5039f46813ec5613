//! # lattice-executor
//!
//! The execution substrate of the lattice runtime: an adaptive
//! work-stealing thread pool mapping an unbounded stream of submitted
//! closures onto a bounded, self-tuning set of OS threads.
//!
//! ## Modules
//!
//! - `work_queue` - hybrid most-recent-slot / deque closure inbox
//! - `thread_count` - sharded busy counter, living-thread count
//! - `work_signal` - condition-variable work notification
//! - `forkable` - process-global registry of fork-aware components
//! - `pool` - the work-stealing pool, its workers, and the lifeguard

pub mod forkable;
pub mod pool;
pub mod thread_count;
pub mod work_queue;
pub mod work_signal;

pub use pool::{PoolConfig, WorkStealingPool};
pub use work_queue::WorkQueue;
