//! Transport operation batches
//!
//! A batch groups the operations submitted to a call in one unit: any
//! subset of the send ops, the receive ops, and stream cancellation.
//! Batches flow top-down through the call stack; each filter may rewrite
//! components, split a batch, or complete components with synthetic
//! errors. Filters must not reorder batches travelling the same
//! direction.
//!
//! Receive ops carry their completion callback in the batch. Filters
//! that need to observe a completion hook it: take the callback, install
//! their own, and invoke the original when done. The server's final
//! status travels in the trailing metadata's typed status entry.

use crate::metadata::Metadata;
use lattice_core::closure::StatusClosure;
use lattice_core::error::{CoreResult, Status};
use std::fmt;

/// Completion callback for a metadata receive op
pub type RecvMetadataCallback = Box<dyn FnOnce(CoreResult<Metadata>) + Send + 'static>;

/// Completion callback for a message receive op; `None` payload means
/// end of stream
pub type RecvMessageCallback = Box<dyn FnOnce(CoreResult<Option<Vec<u8>>>) + Send + 'static>;

/// A group of call operations submitted together
#[derive(Default)]
pub struct Batch {
    pub send_initial_metadata: Option<Metadata>,
    pub send_message: Option<Vec<u8>>,
    pub send_close_from_client: bool,
    pub send_trailing_metadata: Option<Metadata>,
    /// Server-side convenience: a status to fold into trailing metadata
    pub send_status_from_server: Option<Status>,
    pub recv_initial_metadata: Option<RecvMetadataCallback>,
    pub recv_message: Option<RecvMessageCallback>,
    pub recv_trailing_metadata: Option<RecvMetadataCallback>,
    pub cancel_stream: Option<Status>,
    /// Runs when every send component has been processed
    pub on_complete: Option<StatusClosure>,
}

impl Batch {
    pub fn new() -> Batch {
        Batch::default()
    }

    /// A batch carrying only stream cancellation
    pub fn cancel(status: Status) -> Batch {
        Batch {
            cancel_stream: Some(status),
            ..Batch::default()
        }
    }

    pub fn has_send_ops(&self) -> bool {
        self.send_initial_metadata.is_some()
            || self.send_message.is_some()
            || self.send_close_from_client
            || self.send_trailing_metadata.is_some()
            || self.send_status_from_server.is_some()
    }

    pub fn has_recv_ops(&self) -> bool {
        self.recv_initial_metadata.is_some()
            || self.recv_message.is_some()
            || self.recv_trailing_metadata.is_some()
    }

    /// True when nothing remains but (possibly) the completion callback
    pub fn is_empty(&self) -> bool {
        !self.has_send_ops() && !self.has_recv_ops() && self.cancel_stream.is_none()
    }

    /// Complete every component with `status` and consume the batch
    pub fn fail_all(self, status: &Status) {
        if let Some(cb) = self.recv_initial_metadata {
            cb(Err(status.clone()));
        }
        if let Some(cb) = self.recv_message {
            cb(Err(status.clone()));
        }
        if let Some(cb) = self.recv_trailing_metadata {
            cb(Err(status.clone()));
        }
        if let Some(cb) = self.on_complete {
            cb.run(Err(status.clone()));
        }
    }

    /// Complete every component successfully, delivering canned values
    ///
    /// Used by terminal filters that terminate the call locally rather
    /// than talking to a transport.
    pub fn complete_locally(
        self,
        initial_metadata: Metadata,
        message: Option<Vec<u8>>,
        trailing_metadata: Metadata,
    ) {
        if let Some(cb) = self.recv_initial_metadata {
            cb(Ok(initial_metadata));
        }
        if let Some(cb) = self.recv_message {
            cb(Ok(message));
        }
        if let Some(cb) = self.recv_trailing_metadata {
            cb(Ok(trailing_metadata));
        }
        if let Some(cb) = self.on_complete {
            cb.run(Ok(()));
        }
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.send_initial_metadata.is_some() {
            flags.push("send_initial_metadata");
        }
        if self.send_message.is_some() {
            flags.push("send_message");
        }
        if self.send_close_from_client {
            flags.push("send_close_from_client");
        }
        if self.send_trailing_metadata.is_some() {
            flags.push("send_trailing_metadata");
        }
        if self.send_status_from_server.is_some() {
            flags.push("send_status_from_server");
        }
        if self.recv_initial_metadata.is_some() {
            flags.push("recv_initial_metadata");
        }
        if self.recv_message.is_some() {
            flags.push("recv_message");
        }
        if self.recv_trailing_metadata.is_some() {
            flags.push("recv_trailing_metadata");
        }
        if self.cancel_stream.is_some() {
            flags.push("cancel_stream");
        }
        write!(f, "Batch[{}]", flags.join("+"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::error::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_flags() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());
        batch.send_initial_metadata = Some(Metadata::new());
        assert!(batch.has_send_ops());
        assert!(!batch.has_recv_ops());
        batch.recv_message = Some(Box::new(|_| {}));
        assert!(batch.has_recv_ops());
        assert_eq!(format!("{:?}", batch), "Batch[send_initial_metadata+recv_message]");
    }

    #[test]
    fn test_fail_all_reaches_every_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let code = Arc::new(Mutex::new(None));
        let mut batch = Batch::new();
        let h = hits.clone();
        batch.recv_initial_metadata = Some(Box::new(move |r| {
            assert!(r.is_err());
            h.fetch_add(1, Ordering::Relaxed);
        }));
        let h = hits.clone();
        batch.recv_message = Some(Box::new(move |r| {
            assert!(r.is_err());
            h.fetch_add(1, Ordering::Relaxed);
        }));
        let h = hits.clone();
        let c = code.clone();
        batch.recv_trailing_metadata = Some(Box::new(move |r| {
            *c.lock().unwrap() = Some(r.unwrap_err().code());
            h.fetch_add(1, Ordering::Relaxed);
        }));
        let h = hits.clone();
        batch.on_complete = Some(StatusClosure::new(move |r| {
            assert!(r.is_err());
            h.fetch_add(1, Ordering::Relaxed);
        }));
        batch.fail_all(&Status::unavailable("stream not started"));
        assert_eq!(hits.load(Ordering::Relaxed), 4);
        assert_eq!(*code.lock().unwrap(), Some(StatusCode::Unavailable));
    }
}
