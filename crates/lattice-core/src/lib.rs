//! # lattice-core
//!
//! Core types for the lattice RPC runtime execution substrate.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The executor lives in `lattice-executor`; the filter stack and call
//! pipeline live in `lattice-stack`.
//!
//! ## Modules
//!
//! - `closure` - one-shot runnable units
//! - `error` - status codes and the `Status` error type
//! - `args` - immutable channel argument maps
//! - `arena` - per-call bump allocator
//! - `backoff` - exponential backoff schedule
//! - `notify` - one-shot cross-thread notification
//! - `latch` - single-assignment rendezvous cell
//! - `spin` - internal spinlock primitive
//! - `clock` - process-epoch monotonic time
//! - `tracelog` - leveled diagnostic logging macros
//! - `env` - environment variable utilities

pub mod arena;
pub mod args;
pub mod backoff;
pub mod clock;
pub mod closure;
pub mod env;
pub mod error;
pub mod latch;
pub mod notify;
pub mod spin;
pub mod tracelog;

// Re-exports for convenience
pub use arena::{Arena, ArenaBox};
pub use args::{ArgValue, ChannelArgs};
pub use backoff::Backoff;
pub use closure::{Closure, StatusClosure};
pub use error::{CoreResult, Status, StatusCode};
pub use latch::Latch;
pub use notify::Notification;
pub use spin::SpinLock;

/// Shared constants
pub mod constants {
    /// Cache line size for alignment of sharded counters
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Reserved prefix for channel argument keys that must never reach
    /// user-visible surfaces
    pub const RESERVED_ARG_PREFIX: &str = "lattice.internal.";

    /// Channel argument carrying the transport for a channel
    pub const ARG_TRANSPORT: &str = "lattice.internal.transport";

    /// Channel argument requesting the minimal default filter stack
    pub const ARG_MINIMAL_STACK: &str = "lattice.minimal_stack";

    /// Channel argument carrying the error message for a lame channel
    pub const ARG_LAME_MESSAGE: &str = "lattice.lame_client_error";
}
