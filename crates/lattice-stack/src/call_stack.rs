//! Per-call filter chain
//!
//! A call stack mirrors its parent channel stack, holding per-call state
//! for every filter in one block drawn from the call's arena. All
//! manipulation of a call runs inside its combiner, so per-filter call
//! state needs no further locking; the unsafe accessors lean on that
//! invariant.

use crate::batch::Batch;
use crate::channel_stack::{ChannelElemRef, ChannelStack};
use crate::combiner::CallCombiner;
use crate::filter::{CallElemArgs, Filter, PollingEntity};
use lattice_core::arena::Arena;
use lattice_core::closure::Closure;
use lattice_core::error::{CoreResult, Status};
use lattice_core::tlog_trace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Default size of a call arena's first block
///
/// Deployments with large payloads size this up (stress tests run with
/// tens of mebibytes).
pub const DEFAULT_ARENA_INITIAL_SIZE: usize = 64 * 1024;

/// Arguments for creating one call
#[derive(Clone)]
pub struct CallArgs {
    pub path: Arc<str>,
    pub start_time: Instant,
    pub deadline: Option<Instant>,
    pub arena_initial_size: usize,
    pub server_call: bool,
}

impl Default for CallArgs {
    fn default() -> Self {
        CallArgs {
            path: Arc::from("/"),
            start_time: Instant::now(),
            deadline: None,
            arena_initial_size: DEFAULT_ARENA_INITIAL_SIZE,
            server_call: false,
        }
    }
}

impl CallArgs {
    pub fn new(path: impl Into<Arc<str>>) -> Self {
        CallArgs {
            path: path.into(),
            ..CallArgs::default()
        }
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn arena_initial_size(mut self, bytes: usize) -> Self {
        self.arena_initial_size = bytes;
        self
    }

    pub fn server_call(mut self, server: bool) -> Self {
        self.server_call = server;
        self
    }
}

/// Per-call state for every filter of one channel stack
pub struct CallStack {
    channel: Arc<ChannelStack>,
    arena: Arc<Arena>,
    combiner: CallCombiner,
    call_data: *mut u8,
    /// How many elements completed init; drop unwinds exactly these
    inited: AtomicUsize,
    path: Arc<str>,
    start_time: Instant,
    deadline: Option<Instant>,
    server_call: bool,
}

// Safety: per-filter call state is only touched inside the call combiner,
// which serializes all access; the remaining fields are immutable or
// internally synchronized
unsafe impl Send for CallStack {}
unsafe impl Sync for CallStack {}

impl CallStack {
    /// Create a call on `channel`, initializing per-filter state top-down
    pub fn new(channel: &Arc<ChannelStack>, args: CallArgs) -> CoreResult<Arc<CallStack>> {
        let arena = Arc::new(Arena::with_initial_size(args.arena_initial_size));
        let layout = channel.call_data_layout();
        let call_data = if layout.size() == 0 {
            layout.align() as *mut u8
        } else {
            let p = arena.try_alloc_layout(layout)?;
            // Safety: freshly allocated for layout.size() bytes; filters
            // assume zeroed slots
            unsafe { std::ptr::write_bytes(p.as_ptr(), 0, layout.size()) };
            p.as_ptr()
        };
        let stack = Arc::new(CallStack {
            channel: channel.ref_named("call_stack"),
            arena,
            combiner: CallCombiner::new(),
            call_data,
            inited: AtomicUsize::new(0),
            path: args.path.clone(),
            start_time: args.start_time,
            deadline: args.deadline,
            server_call: args.server_call,
        });
        let elem_args = CallElemArgs {
            path: args.path,
            start_time: args.start_time,
            deadline: args.deadline,
            arena: &stack.arena,
            server_call: args.server_call,
        };
        for i in 0..channel.num_elements() {
            let elem = stack.element(i);
            // Safety: slot i is zeroed, sized for this filter, and
            // initialized exactly once; no batches have started yet so
            // the combiner invariant holds trivially
            let result = unsafe {
                channel
                    .filter_at(i)
                    .init_call_data(stack.call_data_ptr_raw(i), &elem, &elem_args)
            };
            match result {
                Ok(()) => stack.inited.store(i + 1, Ordering::Relaxed),
                Err(e) => return Err(e),
            }
        }
        Ok(stack)
    }

    pub fn channel(&self) -> &Arc<ChannelStack> {
        &self.channel
    }

    pub fn num_elements(&self) -> usize {
        self.channel.num_elements()
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn combiner(&self) -> &CallCombiner {
        &self.combiner
    }

    pub fn path(&self) -> &Arc<str> {
        &self.path
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_server_call(&self) -> bool {
        self.server_call
    }

    pub fn element(self: &Arc<Self>, index: usize) -> CallElem {
        debug_assert!(index < self.num_elements());
        CallElem {
            stack: self.clone(),
            index,
        }
    }

    pub(crate) fn call_data_ptr_raw(&self, index: usize) -> *mut u8 {
        let layout = self.channel.filter_at(index).call_data_layout();
        if layout.size() == 0 {
            layout.align() as *mut u8
        } else {
            // Safety: offset lies within the call data block
            unsafe { self.call_data.add(self.channel.call_data_offset(index)) }
        }
    }

    /// Submit a batch to the top of the stack, inside the combiner
    pub fn start_batch(self: &Arc<Self>, batch: Batch) {
        let this = self.ref_named("start_batch");
        self.combiner.start(Closure::new(move || {
            this.start_batch_at(0, batch);
            CallStack::unref_named(this, "start_batch");
        }));
    }

    /// Enter element `index` directly; combiner must already be held
    pub(crate) fn start_batch_at(self: &Arc<Self>, index: usize, batch: Batch) {
        let elem = self.element(index);
        self.channel.filter_at(index).start_batch(&elem, batch);
    }

    /// Cancel the call: notifies the combiner's cancel hook and routes a
    /// cancellation batch through the stack
    pub fn cancel(self: &Arc<Self>, status: Status) {
        self.combiner.cancel(status.clone());
        self.start_batch(Batch::cancel(status));
    }

    /// Install a polling registration on every element
    pub fn set_polling_entity(self: &Arc<Self>, pollent: &PollingEntity) {
        for i in 0..self.num_elements() {
            let elem = self.element(i);
            self.channel.filter_at(i).set_polling_entity(&elem, pollent);
        }
    }

    /// Clone the handle with a trace label
    pub fn ref_named(self: &Arc<Self>, reason: &'static str) -> Arc<CallStack> {
        tlog_trace!(
            "call_stack {} ref -> {} ({})",
            self.path,
            Arc::strong_count(self) + 1,
            reason
        );
        self.clone()
    }

    /// Drop a handle with a trace label
    pub fn unref_named(this: Arc<CallStack>, reason: &'static str) {
        tlog_trace!(
            "call_stack {} unref -> {} ({})",
            this.path,
            Arc::strong_count(&this) - 1,
            reason
        );
        drop(this);
    }
}

impl Drop for CallStack {
    fn drop(&mut self) {
        // Destroy per-filter call state in reverse order; the arena is
        // released when its last handle (including any promise boxes)
        // goes away.
        let inited = self.inited.load(Ordering::Relaxed);
        for i in (0..inited).rev() {
            // Safety: slots 0..inited were initialized and not destroyed
            unsafe {
                self.channel
                    .filter_at(i)
                    .destroy_call_data(self.call_data_ptr_raw(i))
            };
        }
    }
}

/// A filter's position within a call stack
#[derive(Clone)]
pub struct CallElem {
    stack: Arc<CallStack>,
    index: usize,
}

impl CallElem {
    pub fn filter(&self) -> &dyn Filter {
        self.stack.channel.filter_at(self.index).as_ref()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.stack.num_elements()
    }

    pub fn call_stack(&self) -> &Arc<CallStack> {
        &self.stack
    }

    pub fn channel_elem(&self) -> ChannelElemRef {
        self.stack.channel.element(self.index)
    }

    pub fn arena(&self) -> &Arc<Arena> {
        self.stack.arena()
    }

    pub fn combiner(&self) -> &CallCombiner {
        &self.stack.combiner
    }

    /// Raw pointer to this filter's per-call state
    pub fn call_data_ptr<T>(&self) -> *mut T {
        self.stack.call_data_ptr_raw(self.index) as *mut T
    }

    /// Typed view of this filter's per-call state
    ///
    /// # Safety
    /// `T` must be the type `init_call_data` wrote, the call combiner
    /// must be held, and the returned borrow must not overlap another
    /// live borrow of the same slot (re-borrow around calls back into
    /// the stack).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn call_data<T>(&self) -> &mut T {
        &mut *self.call_data_ptr::<T>()
    }

    /// Typed view of this filter's per-channel state
    ///
    /// # Safety
    /// `T` must be the type `init_channel_data` wrote.
    pub unsafe fn channel_data<T>(&self) -> &T {
        &*(self.stack.channel.channel_data_ptr(self.index) as *const T)
    }

    /// Hand a batch to the next element down; combiner is held
    pub fn forward(&self, batch: Batch) {
        assert!(!self.is_last(), "terminal filter cannot forward a batch");
        self.stack.start_batch_at(self.index + 1, batch);
    }
}
