//! Lame channel support
//!
//! When a transport cannot be created, the channel factory substitutes a
//! minimal stack with a single terminal filter that rejects every call
//! with a fixed status. The status code and message are carried in
//! channel args at construction.

use crate::batch::Batch;
use crate::builder::StackBuilder;
use crate::call_stack::CallElem;
use crate::channel_stack::{ChannelElemRef, ChannelStack};
use crate::filter::{ChannelStackArgs, Filter};
use crate::transport::TransportOp;
use lattice_core::args::ChannelArgs;
use lattice_core::constants::ARG_LAME_MESSAGE;
use lattice_core::error::{CoreResult, Status, StatusCode};
use std::alloc::Layout;
use std::sync::Arc;

/// Channel argument carrying the lame channel's status code name
pub const ARG_LAME_STATUS: &str = "lattice.lame_client_status";

struct LameChannelData {
    status: Status,
}

/// Terminal filter rejecting all batches with a fixed status
pub struct LameFilter;

impl std::fmt::Debug for LameFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Filter for LameFilter {
    fn name(&self) -> &'static str {
        "lame-client"
    }

    fn channel_data_layout(&self) -> Layout {
        Layout::new::<LameChannelData>()
    }

    unsafe fn init_channel_data(
        &self,
        data: *mut u8,
        args: &ChannelStackArgs,
    ) -> CoreResult<()> {
        let code = args
            .args
            .get_str(ARG_LAME_STATUS)
            .and_then(StatusCode::from_str_name)
            .unwrap_or(StatusCode::Unavailable);
        let message = args
            .args
            .get_str(ARG_LAME_MESSAGE)
            .unwrap_or("channel is in a permanently failed state")
            .to_string();
        std::ptr::write(
            data as *mut LameChannelData,
            LameChannelData {
                status: Status::new(code, message),
            },
        );
        Ok(())
    }

    unsafe fn destroy_channel_data(&self, data: *mut u8) {
        std::ptr::drop_in_place(data as *mut LameChannelData);
    }

    fn start_batch(&self, elem: &CallElem, batch: Batch) {
        // Safety: type matches this filter's init method
        let status = unsafe { elem.channel_data::<LameChannelData>() }
            .status
            .clone();
        batch.fail_all(&status);
    }

    fn start_transport_op(&self, _elem: &ChannelElemRef, op: TransportOp) {
        // Nothing below to disconnect; just acknowledge.
        if let Some(done) = op.on_consumed {
            done.run();
        }
    }
}

/// Build the minimal stack that fails every call with `status`
pub fn lame_stack(status: Status) -> CoreResult<Arc<ChannelStack>> {
    let args = ChannelArgs::new()
        .set(ARG_LAME_STATUS, status.code().as_str())
        .set(ARG_LAME_MESSAGE, status.message());
    let mut builder = StackBuilder::new("lame-channel");
    builder.register(Arc::new(LameFilter)).terminal();
    builder.build(args)
}
