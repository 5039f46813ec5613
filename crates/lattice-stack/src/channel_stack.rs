//! Per-channel filter chain
//!
//! A channel stack owns an ordered set of filters and a single
//! zero-initialized allocation holding every filter's per-channel state,
//! laid out with alignment padding by `Layout::extend`. The stack is
//! immutable after construction and shared by reference; labeled
//! ref/unref helpers give shutdown paths a debuggable trace.

use crate::filter::{ChannelInfo, ChannelStackArgs, Filter};
use crate::transport::TransportOp;
use lattice_core::args::ChannelArgs;
use lattice_core::error::{CoreResult, Status};
use lattice_core::tlog_trace;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Arc;

#[derive(Debug)]
struct StackElem {
    filter: Arc<dyn Filter>,
    channel_data_offset: usize,
}

/// An ordered, immutable chain of filters for one channel
#[derive(Debug)]
pub struct ChannelStack {
    name: Arc<str>,
    args: ChannelArgs,
    elems: Box<[StackElem]>,
    memory_base: *mut u8,
    memory_layout: Layout,
    call_data_offsets: Box<[usize]>,
    call_data_layout: Layout,
}

// Safety: channel data is written only during construction; afterwards
// filters may only read it or synchronize interior mutability themselves
unsafe impl Send for ChannelStack {}
unsafe impl Sync for ChannelStack {}

/// Accumulate per-filter layouts into one block, recording offsets
fn layout_with_offsets(
    layouts: impl Iterator<Item = Layout>,
) -> (Layout, Vec<usize>) {
    let mut total = Layout::from_size_align(0, 1).unwrap();
    let mut offsets = Vec::new();
    for layout in layouts {
        let (grown, offset) = total.extend(layout).expect("filter state layout overflow");
        total = grown;
        offsets.push(offset);
    }
    (total, offsets)
}

fn dangling_for(layout: Layout) -> *mut u8 {
    layout.align() as *mut u8
}

impl ChannelStack {
    /// Assemble a stack from an ordered filter list
    ///
    /// Filters initialize top-down; a failure unwinds the already
    /// initialized prefix and surfaces as `InvalidArgument`.
    pub(crate) fn build(
        name: Arc<str>,
        filters: Vec<Arc<dyn Filter>>,
        args: ChannelArgs,
    ) -> CoreResult<Arc<ChannelStack>> {
        let (memory_layout, chan_offsets) =
            layout_with_offsets(filters.iter().map(|f| f.channel_data_layout()));
        let (call_data_layout, call_data_offsets) =
            layout_with_offsets(filters.iter().map(|f| f.call_data_layout()));

        let memory_base = if memory_layout.size() == 0 {
            std::ptr::null_mut()
        } else {
            // Safety: nonzero size
            let p = unsafe { alloc_zeroed(memory_layout) };
            if p.is_null() {
                return Err(Status::resource_exhausted(
                    "channel stack allocation failed",
                ));
            }
            p
        };

        let count = filters.len();
        let data_ptr = |i: usize| {
            let layout = filters[i].channel_data_layout();
            if layout.size() == 0 {
                dangling_for(layout)
            } else {
                // Safety: offset lies within the allocated block
                unsafe { memory_base.add(chan_offsets[i]) }
            }
        };
        for (i, filter) in filters.iter().enumerate() {
            let elem_args = ChannelStackArgs {
                name: name.clone(),
                args: args.clone(),
                is_first: i == 0,
                is_last: i + 1 == count,
            };
            // Safety: slot is zeroed, sized for this filter, initialized
            // at most once
            let result = unsafe { filter.init_channel_data(data_ptr(i), &elem_args) };
            if let Err(e) = result {
                for j in (0..i).rev() {
                    // Safety: slots 0..i were initialized above
                    unsafe { filters[j].destroy_channel_data(data_ptr(j)) };
                }
                if !memory_base.is_null() {
                    // Safety: allocated above with memory_layout
                    unsafe { dealloc(memory_base, memory_layout) };
                }
                return Err(Status::invalid_argument(format!(
                    "initializing channel filter {}: {}",
                    filter.name(),
                    e
                )));
            }
        }

        let elems = filters
            .into_iter()
            .enumerate()
            .map(|(i, filter)| StackElem {
                filter,
                channel_data_offset: chan_offsets[i],
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let stack = Arc::new(ChannelStack {
            name,
            args,
            elems,
            memory_base,
            memory_layout,
            call_data_offsets: call_data_offsets.into_boxed_slice(),
            call_data_layout,
        });
        for i in 0..stack.elems.len() {
            let elem = stack.element(i);
            stack.elems[i].filter.post_init_channel_data(&elem);
        }
        Ok(stack)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &ChannelArgs {
        &self.args
    }

    pub fn num_elements(&self) -> usize {
        self.elems.len()
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.elems.iter().map(|e| e.filter.name()).collect()
    }

    pub fn element(self: &Arc<Self>, index: usize) -> ChannelElemRef {
        debug_assert!(index < self.elems.len());
        ChannelElemRef {
            stack: self.clone(),
            index,
        }
    }

    /// Total per-call state layout, computed at build time
    pub fn call_data_layout(&self) -> Layout {
        self.call_data_layout
    }

    pub(crate) fn call_data_offset(&self, index: usize) -> usize {
        self.call_data_offsets[index]
    }

    pub(crate) fn filter_at(&self, index: usize) -> &Arc<dyn Filter> {
        &self.elems[index].filter
    }

    pub(crate) fn channel_data_ptr(&self, index: usize) -> *mut u8 {
        let layout = self.elems[index].filter.channel_data_layout();
        if layout.size() == 0 {
            dangling_for(layout)
        } else {
            // Safety: offset lies within the allocated block
            unsafe { self.memory_base.add(self.elems[index].channel_data_offset) }
        }
    }

    /// Enter the top element with a channel-level operation
    pub fn start_transport_op(self: &Arc<Self>, op: TransportOp) {
        let elem = self.element(0);
        self.elems[0].filter.start_transport_op(&elem, op);
    }

    /// Query the stack for channel information, top-down
    pub fn get_channel_info(self: &Arc<Self>, info: &mut ChannelInfo) {
        for i in 0..self.elems.len() {
            let elem = self.element(i);
            self.elems[i].filter.get_channel_info(&elem, info);
        }
    }

    /// Clone the handle with a trace label
    pub fn ref_named(self: &Arc<Self>, reason: &'static str) -> Arc<ChannelStack> {
        tlog_trace!(
            "channel_stack {} ref -> {} ({})",
            self.name,
            Arc::strong_count(self) + 1,
            reason
        );
        self.clone()
    }

    /// Drop a handle with a trace label
    pub fn unref_named(this: Arc<ChannelStack>, reason: &'static str) {
        tlog_trace!(
            "channel_stack {} unref -> {} ({})",
            this.name,
            Arc::strong_count(&this) - 1,
            reason
        );
        drop(this);
    }
}

impl Drop for ChannelStack {
    fn drop(&mut self) {
        // Per-filter state goes in reverse order, then the block.
        for i in (0..self.elems.len()).rev() {
            let ptr = {
                let layout = self.elems[i].filter.channel_data_layout();
                if layout.size() == 0 {
                    dangling_for(layout)
                } else {
                    // Safety: offset lies within the allocated block
                    unsafe { self.memory_base.add(self.elems[i].channel_data_offset) }
                }
            };
            // Safety: slot was initialized in build and not destroyed since
            unsafe { self.elems[i].filter.destroy_channel_data(ptr) };
        }
        if !self.memory_base.is_null() {
            // Safety: allocated in build with memory_layout
            unsafe { dealloc(self.memory_base, self.memory_layout) };
        }
    }
}

/// A filter's position within a channel stack
#[derive(Clone)]
pub struct ChannelElemRef {
    stack: Arc<ChannelStack>,
    index: usize,
}

impl ChannelElemRef {
    pub fn filter(&self) -> &dyn Filter {
        self.stack.elems[self.index].filter.as_ref()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.stack.elems.len()
    }

    pub fn stack(&self) -> &Arc<ChannelStack> {
        &self.stack
    }

    /// Typed view of this filter's per-channel state
    ///
    /// # Safety
    /// `T` must be the type this filter's `init_channel_data` wrote.
    pub unsafe fn channel_data<T>(&self) -> &T {
        &*(self.stack.channel_data_ptr(self.index) as *const T)
    }

    /// Hand a channel-level op to the next element down
    ///
    /// From the last element the op is consumed: there is nothing below.
    pub fn forward_op(&self, op: TransportOp) {
        if self.is_last() {
            if let Some(done) = op.on_consumed {
                done.run();
            }
            return;
        }
        let next = ChannelElemRef {
            stack: self.stack.clone(),
            index: self.index + 1,
        };
        self.stack.elems[next.index]
            .filter
            .start_transport_op(&next, op);
    }
}
