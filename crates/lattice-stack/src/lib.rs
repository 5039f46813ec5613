//! # lattice-stack
//!
//! Composable filter stacks and the promise-based call pipeline.
//!
//! A channel stack is an ordered chain of filters instantiated once per
//! connection, sharing a single contiguous allocation for per-channel
//! state. Each RPC instantiates a call stack mirroring the channel stack,
//! with per-call state drawn from a per-call arena and all activity
//! serialized through a call combiner. Batches of transport operations
//! flow top-down on the send side and complete bottom-up on the receive
//! side; a promise polled inside the combiner represents the remaining
//! work of the call and yields the server's trailing metadata.
//!
//! ## Modules
//!
//! - `metadata` - ordered call metadata with a typed status entry
//! - `batch` - grouped send/recv operations and their completions
//! - `combiner` - per-call serializing closure queue
//! - `filter` - the filter contract (vtable) and shared context types
//! - `builder` - ordered stack construction from registrations
//! - `channel_stack` - per-channel filter chain and state block
//! - `call_stack` - per-call filter chain, arena, refcounts
//! - `transport` - the downstream transport contract, terminal filter
//! - `lame` - terminal filter rejecting every call
//! - `promise` - promise pipeline adapters (client and server)

pub mod batch;
pub mod builder;
pub mod call_stack;
pub mod channel_stack;
pub mod combiner;
pub mod filter;
pub mod lame;
pub mod metadata;
pub mod promise;
pub mod transport;

pub use batch::Batch;
pub use builder::{PostProcessorSlot, StackBuilder};
pub use call_stack::{CallArgs, CallElem, CallStack};
pub use channel_stack::{ChannelElemRef, ChannelStack};
pub use combiner::CallCombiner;
pub use filter::{ChannelInfo, ChannelStackArgs, Filter, PollingEntity};
pub use metadata::Metadata;
pub use promise::{
    Activity, CallPromise, CallPromiseArgs, ClientPromiseFilter, NextPromiseFactory, Poll,
    Promise, PromiseFilter, ServerPromiseFilter, Waker,
};
pub use transport::{Endpoint, Transport, TransportFilter, TransportOp};
