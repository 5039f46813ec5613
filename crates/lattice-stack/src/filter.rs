//! The filter contract
//!
//! A filter is one stage of a channel stack. It declares the sizes of its
//! per-channel and per-call state, initializes and destroys both in place
//! inside the stacks' contiguous allocations, and handles batches and
//! channel-level operations. Per-call methods run inside the call
//! combiner; per-channel state is immutable after `post_init_channel_data`
//! unless the filter synchronizes it internally.

use crate::batch::Batch;
use crate::call_stack::CallElem;
use crate::channel_stack::ChannelElemRef;
use crate::transport::TransportOp;
use lattice_core::args::ChannelArgs;
use lattice_core::arena::Arena;
use lattice_core::error::CoreResult;
use std::alloc::Layout;
use std::sync::Arc;
use std::time::Instant;

/// Arguments handed to `init_channel_data`
pub struct ChannelStackArgs {
    /// Stack name, for diagnostics
    pub name: Arc<str>,
    pub args: ChannelArgs,
    pub is_first: bool,
    pub is_last: bool,
}

/// Arguments handed to `init_call_data`
pub struct CallElemArgs<'a> {
    pub path: Arc<str>,
    pub start_time: Instant,
    pub deadline: Option<Instant>,
    pub arena: &'a Arc<Arena>,
    pub server_call: bool,
}

/// Answers to `get_channel_info` queries
#[derive(Debug, Default)]
pub struct ChannelInfo {
    pub lb_policy_name: Option<String>,
    pub service_config_json: Option<String>,
    pub transport_name: Option<String>,
}

/// Placeholder polling registration; filters that do not poll ignore it
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingEntity;

/// One stage of a channel/call stack
///
/// The unsafe methods receive raw pointers into the stack's contiguous
/// state block. Contract for all of them: the pointer is valid and
/// suitably aligned for the layout the filter declared, init methods see
/// zeroed memory and run at most once per slot, destroy methods run
/// exactly once on initialized slots.
pub trait Filter: Send + Sync + std::fmt::Debug + 'static {
    /// Human-readable name; also the key for deterministic ordering
    fn name(&self) -> &'static str;

    fn channel_data_layout(&self) -> Layout {
        Layout::new::<()>()
    }

    fn call_data_layout(&self) -> Layout {
        Layout::new::<()>()
    }

    /// Write initialized per-channel state into `data`
    ///
    /// # Safety
    /// See the trait-level pointer contract.
    unsafe fn init_channel_data(
        &self,
        _data: *mut u8,
        _args: &ChannelStackArgs,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// Runs after every element of the stack has initialized
    fn post_init_channel_data(&self, _elem: &ChannelElemRef) {}

    /// Drop the per-channel state in place
    ///
    /// # Safety
    /// See the trait-level pointer contract.
    unsafe fn destroy_channel_data(&self, _data: *mut u8) {}

    /// Write initialized per-call state into `data`
    ///
    /// # Safety
    /// See the trait-level pointer contract; additionally the call
    /// combiner is held.
    unsafe fn init_call_data(
        &self,
        _data: *mut u8,
        _elem: &CallElem,
        _args: &CallElemArgs<'_>,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// Drop the per-call state in place
    ///
    /// # Safety
    /// See the trait-level pointer contract.
    unsafe fn destroy_call_data(&self, _data: *mut u8) {}

    /// Handle a batch inside the call combiner
    ///
    /// The filter may forward (possibly rewritten) via `elem.forward`,
    /// split the batch, or complete components with synthetic errors.
    /// Batches from the same direction must not be reordered.
    fn start_batch(&self, elem: &CallElem, batch: Batch);

    /// Handle a channel-level operation; the default forwards it
    fn start_transport_op(&self, elem: &ChannelElemRef, op: TransportOp) {
        elem.forward_op(op);
    }

    fn get_channel_info(&self, _elem: &ChannelElemRef, _info: &mut ChannelInfo) {}

    /// Polling registration plumbing; most filters ignore it
    fn set_polling_entity(&self, _elem: &CallElem, _pollent: &PollingEntity) {}

    /// Whether this filter participates in the promise pipeline
    fn supports_promises(&self) -> bool {
        false
    }
}
