//! The downstream transport contract
//!
//! A transport owns the byte-level protocol below the filter stack. It is
//! installed into the channel arguments under a reserved internal key and
//! is mandatory for any non-lame channel; the terminal
//! [`TransportFilter`] bridges batches from the stack into it. Stream op
//! completion is asynchronous: the transport invokes the batch's
//! completion callbacks whenever it finishes, on whatever thread it
//! likes.

use crate::batch::Batch;
use crate::call_stack::CallElem;
use crate::channel_stack::ChannelElemRef;
use crate::filter::{CallElemArgs, ChannelInfo, ChannelStackArgs, Filter, PollingEntity};
use lattice_core::arena::Arena;
use lattice_core::args::{cmp_by_identity, ArgPointer, ChannelArgs, PointerVtable};
use lattice_core::closure::Closure;
use lattice_core::constants::ARG_TRANSPORT;
use lattice_core::error::{CoreResult, Status};
use std::alloc::Layout;
use std::any::Any;
use std::sync::Arc;

/// A channel-level operation
#[derive(Default)]
pub struct TransportOp {
    /// Tear the connection down with this error
    pub disconnect_with_error: Option<Status>,
    /// Runs once the op has been fully consumed
    pub on_consumed: Option<Closure>,
}

impl TransportOp {
    pub fn new() -> TransportOp {
        TransportOp::default()
    }

    pub fn disconnect(status: Status) -> TransportOp {
        TransportOp {
            disconnect_with_error: Some(status),
            on_consumed: None,
        }
    }
}

/// A byte-stream endpoint under a transport
pub trait Endpoint: Send + Sync + 'static {
    fn local_address(&self) -> String;

    fn write(&self, data: Vec<u8>, on_done: lattice_core::closure::StatusClosure);

    fn read(&self, on_data: Box<dyn FnOnce(CoreResult<Vec<u8>>) + Send + 'static>);
}

/// Transport-owned per-stream state, opaque to the stack
pub type StreamData = Box<dyn Any + Send>;

/// The contract a transport implements toward the filter stack
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Create per-stream state for a new call
    fn init_stream(&self, arena: &Arc<Arena>, server_call: bool) -> CoreResult<StreamData>;

    /// Start a batch on a stream; completions are delivered through the
    /// batch's callbacks, possibly asynchronously
    fn perform_stream_op(&self, stream: &mut StreamData, batch: Batch);

    /// Channel-level operation (disconnect and friends)
    fn perform_op(&self, op: TransportOp);

    /// Release per-stream state; `then` runs once teardown is complete
    fn destroy_stream(&self, stream: StreamData, then: Option<Closure>);

    fn endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        None
    }

    fn set_polling_entity(&self, _stream: &mut StreamData, _pollent: &PollingEntity) {}
}

static TRANSPORT_VTABLE: PointerVtable = PointerVtable {
    type_name: "transport",
    cmp: cmp_by_identity,
};

struct TransportArg(Arc<dyn Transport>);

/// Install `transport` into channel args under the reserved key
pub fn set_transport(args: &ChannelArgs, transport: Arc<dyn Transport>) -> ChannelArgs {
    args.set(
        ARG_TRANSPORT,
        ArgPointer::owned(Arc::new(TransportArg(transport)), &TRANSPORT_VTABLE),
    )
}

/// Retrieve the installed transport, if any
pub fn get_transport(args: &ChannelArgs) -> Option<Arc<dyn Transport>> {
    args.get_pointer_ref::<TransportArg>(ARG_TRANSPORT)
        .map(|t| t.0.clone())
}

struct TransportChannelData {
    transport: Arc<dyn Transport>,
}

struct TransportCallData {
    transport: Arc<dyn Transport>,
    stream: Option<StreamData>,
}

/// Terminal filter handing batches to the channel's transport
pub struct TransportFilter;

impl std::fmt::Debug for TransportFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Filter for TransportFilter {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn channel_data_layout(&self) -> Layout {
        Layout::new::<TransportChannelData>()
    }

    fn call_data_layout(&self) -> Layout {
        Layout::new::<TransportCallData>()
    }

    unsafe fn init_channel_data(
        &self,
        data: *mut u8,
        args: &ChannelStackArgs,
    ) -> CoreResult<()> {
        let transport = get_transport(&args.args).ok_or_else(|| {
            Status::invalid_argument("transport filter requires a transport channel arg")
        })?;
        std::ptr::write(
            data as *mut TransportChannelData,
            TransportChannelData { transport },
        );
        Ok(())
    }

    unsafe fn destroy_channel_data(&self, data: *mut u8) {
        std::ptr::drop_in_place(data as *mut TransportChannelData);
    }

    unsafe fn init_call_data(
        &self,
        data: *mut u8,
        elem: &CallElem,
        args: &CallElemArgs<'_>,
    ) -> CoreResult<()> {
        let transport = elem.channel_data::<TransportChannelData>().transport.clone();
        let stream = transport.init_stream(args.arena, args.server_call)?;
        std::ptr::write(
            data as *mut TransportCallData,
            TransportCallData {
                transport,
                stream: Some(stream),
            },
        );
        Ok(())
    }

    unsafe fn destroy_call_data(&self, data: *mut u8) {
        let call_data = &mut *(data as *mut TransportCallData);
        if let Some(stream) = call_data.stream.take() {
            call_data.transport.destroy_stream(stream, None);
        }
        std::ptr::drop_in_place(data as *mut TransportCallData);
    }

    fn start_batch(&self, elem: &CallElem, batch: Batch) {
        // Safety: combiner held; type matches this filter's init method
        let call_data = unsafe { elem.call_data::<TransportCallData>() };
        let transport = call_data.transport.clone();
        match call_data.stream.as_mut() {
            Some(stream) => transport.perform_stream_op(stream, batch),
            None => batch.fail_all(&Status::unavailable("stream not started")),
        }
    }

    fn start_transport_op(&self, elem: &ChannelElemRef, op: TransportOp) {
        // Safety: types match this filter's init methods
        let transport = unsafe { elem.channel_data::<TransportChannelData>() }
            .transport
            .clone();
        transport.perform_op(op);
    }

    fn get_channel_info(&self, elem: &ChannelElemRef, info: &mut ChannelInfo) {
        // Safety: types match this filter's init methods
        let transport = unsafe { elem.channel_data::<TransportChannelData>() }
            .transport
            .clone();
        info.transport_name = Some(transport.name().to_string());
    }

    fn set_polling_entity(&self, elem: &CallElem, pollent: &PollingEntity) {
        // Safety: combiner held; type matches this filter's init method
        let call_data = unsafe { elem.call_data::<TransportCallData>() };
        let transport = call_data.transport.clone();
        if let Some(stream) = call_data.stream.as_mut() {
            transport.set_polling_entity(stream, pollent);
        }
    }
}
