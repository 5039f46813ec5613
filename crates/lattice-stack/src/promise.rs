//! Promise-based call pipeline
//!
//! A promise represents the remaining work of a call: a suspendable state
//! machine polled inside the call combiner that ultimately yields the
//! server's trailing metadata. Filters written against the promise
//! contract implement [`PromiseFilter`]; the [`ClientPromiseFilter`] and
//! [`ServerPromiseFilter`] adapters splice them into a batch-oriented
//! stack.
//!
//! Client side: the first `send_initial_metadata` batch is captured
//! rather than forwarded, and the filter's `make_call_promise` runs with
//! the initial metadata, an optional latch for observing server initial
//! metadata, and a `next` continuation. Invoking `next` resumes the
//! captured batch down the stack and returns a promise that resolves
//! once trailing metadata arrives from the transport. If the filter's
//! promise completes before the transport does, the stream below is
//! cancelled with a status drawn from the produced trailing metadata.
//!
//! Server side is symmetric, triggered by the receipt of client initial
//! metadata; the promise's result is forwarded down the stack as a
//! `send_trailing_metadata` batch.

use crate::batch::{Batch, RecvMetadataCallback};
use crate::call_stack::{CallElem, CallStack};
use crate::filter::{CallElemArgs, Filter};
use crate::metadata::Metadata;
use lattice_core::arena::{Arena, ArenaBox};
use lattice_core::closure::{Closure, StatusClosure};
use lattice_core::error::{CoreResult, Status};
use lattice_core::latch::Latch;
use lattice_core::tlog_trace;
use std::alloc::Layout;
use std::sync::{Arc, Weak};

/// Result of polling a promise
pub enum Poll<T> {
    Pending,
    Ready(T),
}

/// A suspendable unit of remaining call work
///
/// Polled only inside the owning call's combiner, and only after the
/// send path has been primed.
pub trait Promise: Send {
    fn poll(&mut self, activity: &mut Activity<'_>) -> Poll<Metadata>;
}

/// An arena-allocated promise
pub type CallPromise = ArenaBox<dyn Promise>;

/// The poll context: records which call owns the poll and collects
/// synchronous wakeup requests
pub struct Activity<'a> {
    call: &'a Arc<CallStack>,
    wake_fn: &'a Arc<dyn Fn() + Send + Sync>,
    repoll: bool,
}

impl<'a> Activity<'a> {
    pub fn new(call: &'a Arc<CallStack>, wake_fn: &'a Arc<dyn Fn() + Send + Sync>) -> Self {
        Activity {
            call,
            wake_fn,
            repoll: false,
        }
    }

    pub fn call(&self) -> &Arc<CallStack> {
        self.call
    }

    /// A handle that re-polls this call later, from any thread
    pub fn waker(&self) -> Waker {
        Waker {
            call: self.call.ref_named("waker"),
            wake_fn: self.wake_fn.clone(),
        }
    }

    /// Request another poll as soon as the current one returns
    pub fn force_immediate_repoll(&mut self) {
        self.repoll = true;
    }

    pub(crate) fn should_repoll(&self) -> bool {
        self.repoll
    }
}

/// Wakes a suspended call promise by scheduling a poll in its combiner
///
/// Holds a labeled reference on the call stack for as long as it lives.
pub struct Waker {
    call: Arc<CallStack>,
    wake_fn: Arc<dyn Fn() + Send + Sync>,
}

impl Waker {
    pub fn wake(&self) {
        let wake_fn = self.wake_fn.clone();
        self.call
            .combiner()
            .start(Closure::new(move || wake_fn()));
    }
}

impl Clone for Waker {
    fn clone(&self) -> Self {
        Waker {
            call: self.call.ref_named("waker"),
            wake_fn: self.wake_fn.clone(),
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        tlog_trace!("call_stack {} waker dropped", self.call.path());
    }
}

/// Arguments to `make_call_promise`
pub struct CallPromiseArgs {
    /// Client initial metadata (client side) or the received client
    /// initial metadata (server side)
    pub initial_metadata: Metadata,
    /// Present when the filter asked to observe server initial metadata;
    /// set exactly once when it arrives
    pub server_initial_metadata: Option<Arc<Latch<Metadata>>>,
}

/// Continuation representing the rest of the stack
///
/// Calling it (with possibly-rewritten initial metadata) resumes the
/// captured batch downward and returns a promise resolving to server
/// trailing metadata.
pub type NextPromiseFactory = Box<dyn FnOnce(Metadata) -> CallPromise + Send + 'static>;

/// A filter written against the promise contract
pub trait PromiseFilter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether the filter wants server initial metadata delivered
    /// through the latch
    fn examines_server_initial_metadata(&self) -> bool {
        false
    }

    /// Build the promise for one call; `arena` is the call's arena
    fn make_call_promise(
        &self,
        arena: &Arc<Arena>,
        args: CallPromiseArgs,
        next: NextPromiseFactory,
    ) -> CallPromise;
}

/// Weak position handle breaking the call-data -> call-stack cycle
///
/// Hooks and promises stored inside call data must not keep the call
/// stack alive; they upgrade on use and go quiet if the call is gone.
#[derive(Clone)]
struct WeakElem {
    stack: Weak<CallStack>,
    index: usize,
}

impl WeakElem {
    fn from_elem(elem: &CallElem) -> Self {
        WeakElem {
            stack: Arc::downgrade(elem.call_stack()),
            index: elem.index(),
        }
    }

    fn upgrade(&self) -> Option<CallElem> {
        self.stack.upgrade().map(|stack| stack.element(self.index))
    }
}

// ---------------------------------------------------------------------------
// Client adapter

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SendInitialState {
    Initial,
    Queued,
    Forwarded,
    Complete,
    Cancelled,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RecvInitialState {
    Initial,
    HookedWaitingForLatch,
    HookedAndGotLatch,
    CompleteAndGotLatch,
    CompleteAndSetLatch,
    Responded,
}

struct ClientCallData {
    send_state: SendInitialState,
    recv_initial_state: RecvInitialState,
    /// Batch captured on the first send_initial_metadata
    captured: Option<Batch>,
    /// Send-op batches arriving while the captured batch is queued
    pending: Vec<Batch>,
    promise: Option<CallPromise>,
    latch: Option<Arc<Latch<Metadata>>>,
    wake_fn: Arc<dyn Fn() + Send + Sync>,
    recv_initial_cb: Option<RecvMetadataCallback>,
    recv_initial_md: Option<Metadata>,
    recv_trailing_cb: Option<RecvMetadataCallback>,
    recv_trailing_md: Option<Metadata>,
    /// Whether the transport ever delivered trailing metadata; decides
    /// between normal completion and an early return on finish
    saw_transport_trailing: bool,
    /// Trailing metadata the promise produced before a hook existed
    final_trailing: Option<Metadata>,
    cancel_error: Option<Status>,
    polling: bool,
}

/// Adapter running a [`PromiseFilter`] on the client side of a stack
pub struct ClientPromiseFilter {
    inner: Arc<dyn PromiseFilter>,
}

impl ClientPromiseFilter {
    pub fn new(inner: Arc<dyn PromiseFilter>) -> Arc<dyn Filter> {
        Arc::new(ClientPromiseFilter {
            inner,
        })
    }
}

fn make_wake_fn(elem: &CallElem, poll: fn(&CallElem)) -> Arc<dyn Fn() + Send + Sync> {
    let weak = WeakElem::from_elem(elem);
    Arc::new(move || {
        if let Some(elem) = weak.upgrade() {
            poll(&elem);
        }
    })
}

impl std::fmt::Debug for ClientPromiseFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.inner.name())
    }
}

impl Filter for ClientPromiseFilter {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn call_data_layout(&self) -> Layout {
        Layout::new::<ClientCallData>()
    }

    unsafe fn init_call_data(
        &self,
        data: *mut u8,
        elem: &CallElem,
        _args: &CallElemArgs<'_>,
    ) -> CoreResult<()> {
        let latch = self
            .inner
            .examines_server_initial_metadata()
            .then(|| Arc::new(Latch::new()));
        std::ptr::write(
            data as *mut ClientCallData,
            ClientCallData {
                send_state: SendInitialState::Initial,
                recv_initial_state: RecvInitialState::Initial,
                captured: None,
                pending: Vec::new(),
                promise: None,
                latch,
                wake_fn: make_wake_fn(elem, client_poll_loop),
                recv_initial_cb: None,
                recv_initial_md: None,
                recv_trailing_cb: None,
                recv_trailing_md: None,
                saw_transport_trailing: false,
                final_trailing: None,
                cancel_error: None,
                polling: false,
            },
        );
        Ok(())
    }

    unsafe fn destroy_call_data(&self, data: *mut u8) {
        std::ptr::drop_in_place(data as *mut ClientCallData);
    }

    fn supports_promises(&self) -> bool {
        true
    }

    fn start_batch(&self, elem: &CallElem, mut batch: Batch) {
        if let Some(status) = batch.cancel_stream.clone() {
            client_cancel(elem, status);
            elem.forward(batch);
            return;
        }
        {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            if cd.send_state == SendInitialState::Cancelled {
                let error = cd
                    .cancel_error
                    .clone()
                    .unwrap_or_else(|| Status::cancelled("call already cancelled"));
                batch.fail_all(&error);
                return;
            }
        }

        // Hook the receive ops the promise needs to observe.
        let mut deliver_now: Option<(RecvMetadataCallback, Metadata)> = None;
        {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            if let Some(original) = batch.recv_trailing_metadata.take() {
                if let Some(final_md) = cd.final_trailing.take() {
                    // the promise already finished this call
                    deliver_now = Some((original, final_md));
                } else {
                    cd.recv_trailing_cb = Some(original);
                    batch.recv_trailing_metadata = Some(make_recv_trailing_hook(elem));
                }
            }
            if batch.recv_initial_metadata.is_some() && cd.latch.is_some() {
                let original = batch.recv_initial_metadata.take().unwrap();
                cd.recv_initial_cb = Some(original);
                batch.recv_initial_metadata = Some(make_recv_initial_hook(elem));
                if cd.recv_initial_state == RecvInitialState::Initial {
                    cd.recv_initial_state = if cd.promise.is_some() {
                        RecvInitialState::HookedAndGotLatch
                    } else {
                        RecvInitialState::HookedWaitingForLatch
                    };
                }
            }
        }
        if let Some((cb, md)) = deliver_now {
            cb(Ok(md));
        }

        // The first send_initial_metadata engages the promise pipeline:
        // capture the batch and build the filter's promise.
        let engage = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            batch.send_initial_metadata.is_some()
                && cd.send_state == SendInitialState::Initial
        };
        if engage {
            let initial_md = batch.send_initial_metadata.take().unwrap();
            let latch = {
                // Safety: combiner held; type matches init_call_data
                let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
                cd.captured = Some(batch);
                cd.send_state = SendInitialState::Queued;
                if cd.recv_initial_state == RecvInitialState::HookedWaitingForLatch {
                    cd.recv_initial_state = RecvInitialState::HookedAndGotLatch;
                }
                cd.latch.clone()
            };
            let weak = WeakElem::from_elem(elem);
            let arena = elem.arena().clone();
            let next: NextPromiseFactory =
                Box::new(move |md| resume_captured(&weak, md, &arena));
            let promise = self.inner.make_call_promise(
                elem.arena(),
                CallPromiseArgs {
                    initial_metadata: initial_md,
                    server_initial_metadata: latch,
                },
                next,
            );
            {
                // Safety: combiner held; type matches init_call_data
                let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
                cd.promise = Some(promise);
            }
            client_poll_loop(elem);
            return;
        }

        // Send ops arriving while the captured batch is still queued keep
        // their submission order behind it.
        let queue_behind_captured = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            cd.send_state == SendInitialState::Queued && batch.has_send_ops()
        };
        if queue_behind_captured {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            cd.pending.push(batch);
            return;
        }

        if batch.is_empty() {
            if let Some(on_complete) = batch.on_complete.take() {
                on_complete.run(Ok(()));
            }
            return;
        }
        elem.forward(batch);
    }
}

fn make_recv_trailing_hook(elem: &CallElem) -> RecvMetadataCallback {
    let weak = WeakElem::from_elem(elem);
    Box::new(move |result| {
        if let Some(elem) = weak.upgrade() {
            let target = elem.clone();
            elem.combiner().start(Closure::new(move || {
                client_on_recv_trailing(&target, result);
            }));
        }
    })
}

fn make_recv_initial_hook(elem: &CallElem) -> RecvMetadataCallback {
    let weak = WeakElem::from_elem(elem);
    Box::new(move |result| {
        if let Some(elem) = weak.upgrade() {
            let target = elem.clone();
            elem.combiner().start(Closure::new(move || {
                client_on_recv_initial(&target, result);
            }));
        }
    })
}

/// Resume the captured batch down the stack; this is the body of the
/// `next` continuation handed to `make_call_promise`
fn resume_captured(weak: &WeakElem, md: Metadata, arena: &Arc<Arena>) -> CallPromise {
    if let Some(elem) = weak.upgrade() {
        let (batch, pending) = {
            // Safety: combiner held (next runs inside a poll); type
            // matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            debug_assert_eq!(cd.send_state, SendInitialState::Queued);
            let mut batch = cd.captured.take().unwrap_or_default();
            batch.send_initial_metadata = Some(md);
            cd.send_state = SendInitialState::Forwarded;
            (batch, std::mem::take(&mut cd.pending))
        };
        elem.forward(batch);
        for pending_batch in pending {
            elem.forward(pending_batch);
        }
    }
    ArenaBox::new(arena, TrailingWait {
        elem: weak.clone(),
    })
    .erase(|p| p as &mut dyn Promise)
}

/// Resolves when the transport delivers trailing metadata
struct TrailingWait {
    elem: WeakElem,
}

impl Promise for TrailingWait {
    fn poll(&mut self, _activity: &mut Activity<'_>) -> Poll<Metadata> {
        match self.elem.upgrade() {
            Some(elem) => {
                // Safety: polled inside the combiner; type matches
                // init_call_data
                let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
                match cd.recv_trailing_md.take() {
                    Some(md) => Poll::Ready(md),
                    None => Poll::Pending,
                }
            }
            None => Poll::Pending,
        }
    }
}

fn client_poll_loop(elem: &CallElem) {
    {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
        if cd.polling {
            return;
        }
        cd.polling = true;
    }
    loop {
        // Connect arrived server initial metadata to the latch before
        // polling so the filter observes it this round.
        let set_latch = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            if cd.recv_initial_state == RecvInitialState::CompleteAndGotLatch {
                cd.recv_initial_state = RecvInitialState::CompleteAndSetLatch;
                match (cd.latch.clone(), cd.recv_initial_md.clone()) {
                    (Some(latch), Some(md)) => Some((latch, md)),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some((latch, md)) = set_latch {
            latch.set(md);
        }

        // Take the promise out of call data so its poll cannot alias the
        // borrows taken by `next` and the sub-promises.
        let promise = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            cd.promise.take()
        };
        let Some(mut promise) = promise else {
            break;
        };
        let wake_fn = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            cd.wake_fn.clone()
        };
        let mut activity = Activity::new(elem.call_stack(), &wake_fn);
        match promise.poll(&mut activity) {
            Poll::Ready(trailing) => {
                drop(promise);
                client_finish(elem, trailing);
                break;
            }
            Poll::Pending => {
                // Safety: combiner held; type matches init_call_data
                let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
                // a cancel during the poll discards the promise
                if cd.send_state != SendInitialState::Cancelled {
                    cd.promise = Some(promise);
                }
            }
        }
        respond_with_initial_metadata(elem);
        if !activity.should_repoll() {
            break;
        }
    }
    // Safety: combiner held; type matches init_call_data
    let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
    cd.polling = false;
}

/// After the filter's promise has had a chance to observe the latch,
/// release the hooked recv-initial completion to its original callback
fn respond_with_initial_metadata(elem: &CallElem) {
    let ready = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
        if cd.recv_initial_state == RecvInitialState::CompleteAndSetLatch {
            match (cd.recv_initial_cb.take(), cd.recv_initial_md.clone()) {
                (Some(cb), Some(md)) => {
                    cd.recv_initial_state = RecvInitialState::Responded;
                    Some((cb, md))
                }
                (cb, _) => {
                    cd.recv_initial_cb = cb;
                    None
                }
            }
        } else {
            None
        }
    };
    if let Some((cb, md)) = ready {
        cb(Ok(md));
    }
}

fn client_finish(elem: &CallElem, trailing: Metadata) {
    let failure_status = trailing
        .status()
        .map(|code| Status::new(code, trailing.status_message().unwrap_or("").to_string()))
        .unwrap_or_else(|| Status::cancelled("call completed early"));

    enum FinishAction {
        CancelDownstream,
        FailCaptured(Vec<Batch>),
        Nothing,
    }
    let action = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
        match cd.send_state {
            SendInitialState::Forwarded => {
                cd.send_state = SendInitialState::Complete;
                if cd.saw_transport_trailing {
                    FinishAction::Nothing
                } else {
                    FinishAction::CancelDownstream
                }
            }
            SendInitialState::Queued | SendInitialState::Initial => {
                cd.send_state = SendInitialState::Complete;
                let mut batches = Vec::new();
                if let Some(captured) = cd.captured.take() {
                    batches.push(captured);
                }
                batches.append(&mut cd.pending);
                FinishAction::FailCaptured(batches)
            }
            SendInitialState::Complete | SendInitialState::Cancelled => FinishAction::Nothing,
        }
    };
    match action {
        FinishAction::CancelDownstream => {
            // Early return: the promise resolved before the transport;
            // tear the stream down with the status it produced.
            elem.forward(Batch::cancel(failure_status.clone()));
        }
        FinishAction::FailCaptured(batches) => {
            for batch in batches {
                batch.fail_all(&failure_status);
            }
        }
        FinishAction::Nothing => {}
    }

    // A hooked-but-unanswered initial metadata completion ends with the
    // call.
    let initial_cb = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
        match cd.recv_initial_state {
            RecvInitialState::Responded => None,
            _ => {
                let md = cd.recv_initial_md.clone();
                cd.recv_initial_state = RecvInitialState::Responded;
                cd.recv_initial_cb.take().map(|cb| (cb, md))
            }
        }
    };
    if let Some((cb, md)) = initial_cb {
        match md {
            Some(md) => cb(Ok(md)),
            None => cb(Err(failure_status.clone())),
        }
    }

    // Deliver the final trailing metadata.
    let trailing_cb = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
        match cd.recv_trailing_cb.take() {
            Some(cb) => Some(cb),
            None => {
                cd.final_trailing = Some(trailing.clone());
                None
            }
        }
    };
    if let Some(cb) = trailing_cb {
        cb(Ok(trailing));
    }
}

fn client_on_recv_initial(elem: &CallElem, result: CoreResult<Metadata>) {
    let md = result.unwrap_or_else(|status| Metadata::from_status(&status));
    let (respond_directly, has_promise) = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
        match cd.recv_initial_state {
            RecvInitialState::HookedWaitingForLatch | RecvInitialState::HookedAndGotLatch => {
                cd.recv_initial_md = Some(md.clone());
                cd.recv_initial_state = RecvInitialState::CompleteAndGotLatch;
                (false, cd.promise.is_some())
            }
            _ => (true, false),
        }
    };
    if respond_directly {
        let cb = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            cd.recv_initial_state = RecvInitialState::Responded;
            cd.recv_initial_cb.take()
        };
        if let Some(cb) = cb {
            cb(Ok(md));
        }
    } else if has_promise {
        client_poll_loop(elem);
    }
}

fn client_on_recv_trailing(elem: &CallElem, result: CoreResult<Metadata>) {
    // Peer-only receive errors become synthesized trailing metadata.
    let md = result.unwrap_or_else(|status| Metadata::from_status(&status));
    let has_promise = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
        cd.recv_trailing_md = Some(md);
        cd.saw_transport_trailing = true;
        cd.promise.is_some()
    };
    if has_promise {
        client_poll_loop(elem);
    } else {
        let pair = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
            match (cd.recv_trailing_cb.take(), cd.recv_trailing_md.take()) {
                (Some(cb), Some(md)) => Some((cb, md)),
                (cb, md) => {
                    cd.recv_trailing_cb = cb;
                    cd.recv_trailing_md = md;
                    None
                }
            }
        };
        if let Some((cb, md)) = pair {
            cb(Ok(md));
        }
    }
}

fn client_cancel(elem: &CallElem, status: Status) {
    let cleanup = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ClientCallData>() };
        if cd.send_state == SendInitialState::Cancelled {
            None
        } else {
            cd.send_state = SendInitialState::Cancelled;
            cd.cancel_error = Some(status.clone());
            cd.recv_initial_state = RecvInitialState::Responded;
            Some((
                cd.captured.take(),
                std::mem::take(&mut cd.pending),
                cd.recv_initial_cb.take(),
                cd.recv_trailing_cb.take(),
                cd.promise.take(),
            ))
        }
    };
    let Some((captured, pending, initial_cb, trailing_cb, promise)) = cleanup else {
        return;
    };
    // the promise is discarded without completing
    drop(promise);
    if let Some(batch) = captured {
        batch.fail_all(&status);
    }
    for batch in pending {
        batch.fail_all(&status);
    }
    if let Some(cb) = initial_cb {
        cb(Err(status.clone()));
    }
    if let Some(cb) = trailing_cb {
        cb(Err(status));
    }
}

// ---------------------------------------------------------------------------
// Server adapter

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ServerState {
    Initial,
    Promised,
    Responded,
    Cancelled,
}

struct ServerCallData {
    state: ServerState,
    recv_initial_cb: Option<RecvMetadataCallback>,
    /// Trailing metadata captured from the application's send path
    captured_trailing: Option<Metadata>,
    captured_on_complete: Option<StatusClosure>,
    promise: Option<CallPromise>,
    inner: Arc<dyn PromiseFilter>,
    wake_fn: Arc<dyn Fn() + Send + Sync>,
    cancel_error: Option<Status>,
    polling: bool,
}

/// Adapter running a [`PromiseFilter`] on the server side of a stack
///
/// Triggered by the receipt of client initial metadata; the promise's
/// trailing metadata is forwarded down the stack as a send.
pub struct ServerPromiseFilter {
    inner: Arc<dyn PromiseFilter>,
}

impl ServerPromiseFilter {
    pub fn new(inner: Arc<dyn PromiseFilter>) -> Arc<dyn Filter> {
        Arc::new(ServerPromiseFilter {
            inner,
        })
    }
}

impl std::fmt::Debug for ServerPromiseFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.inner.name())
    }
}

impl Filter for ServerPromiseFilter {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn call_data_layout(&self) -> Layout {
        Layout::new::<ServerCallData>()
    }

    unsafe fn init_call_data(
        &self,
        data: *mut u8,
        elem: &CallElem,
        _args: &CallElemArgs<'_>,
    ) -> CoreResult<()> {
        std::ptr::write(
            data as *mut ServerCallData,
            ServerCallData {
                state: ServerState::Initial,
                recv_initial_cb: None,
                captured_trailing: None,
                captured_on_complete: None,
                promise: None,
                inner: self.inner.clone(),
                wake_fn: make_wake_fn(elem, server_poll_loop),
                cancel_error: None,
                polling: false,
            },
        );
        Ok(())
    }

    unsafe fn destroy_call_data(&self, data: *mut u8) {
        std::ptr::drop_in_place(data as *mut ServerCallData);
    }

    fn supports_promises(&self) -> bool {
        true
    }

    fn start_batch(&self, elem: &CallElem, mut batch: Batch) {
        if let Some(status) = batch.cancel_stream.clone() {
            server_cancel(elem, status);
            elem.forward(batch);
            return;
        }
        {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
            if cd.state == ServerState::Cancelled {
                let error = cd
                    .cancel_error
                    .clone()
                    .unwrap_or_else(|| Status::cancelled("call already cancelled"));
                batch.fail_all(&error);
                return;
            }

            // The pipeline engages when client initial metadata arrives.
            if batch.recv_initial_metadata.is_some() && cd.state == ServerState::Initial {
                let original = batch.recv_initial_metadata.take().unwrap();
                cd.recv_initial_cb = Some(original);
                batch.recv_initial_metadata = Some(make_server_recv_initial_hook(elem));
            }

            // Fold an explicit server status into trailing metadata.
            if let Some(status) = batch.send_status_from_server.take() {
                let mut md = batch.send_trailing_metadata.take().unwrap_or_default();
                md.set_status(status.code());
                md.set_status_message(status.message());
                batch.send_trailing_metadata = Some(md);
            }
        }

        // While promised, the application's trailing metadata is captured
        // for the promise instead of going to the wire directly.
        let poll_after = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
            if cd.state == ServerState::Promised && batch.send_trailing_metadata.is_some() {
                cd.captured_trailing = batch.send_trailing_metadata.take();
                cd.captured_on_complete = batch.on_complete.take();
                true
            } else if cd.state == ServerState::Responded
                && batch.send_trailing_metadata.is_some()
            {
                batch.fail_all(&Status::unavailable("call already completed"));
                return;
            } else {
                false
            }
        };

        if batch.is_empty() {
            if let Some(on_complete) = batch.on_complete.take() {
                on_complete.run(Ok(()));
            }
        } else {
            elem.forward(batch);
        }
        if poll_after {
            server_poll_loop(elem);
        }
    }
}

fn make_server_recv_initial_hook(elem: &CallElem) -> RecvMetadataCallback {
    let weak = WeakElem::from_elem(elem);
    Box::new(move |result| {
        if let Some(elem) = weak.upgrade() {
            let target = elem.clone();
            elem.combiner().start(Closure::new(move || {
                server_on_recv_initial(&target, result);
            }));
        }
    })
}

fn server_on_recv_initial(elem: &CallElem, result: CoreResult<Metadata>) {
    let md = match result {
        Ok(md) => md,
        Err(status) => {
            // no call to run; release the hooked completion with the error
            let cb = {
                // Safety: combiner held; type matches init_call_data
                let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
                cd.recv_initial_cb.take()
            };
            if let Some(cb) = cb {
                cb(Err(status));
            }
            return;
        }
    };
    let inner = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
        if cd.state != ServerState::Initial {
            return;
        }
        cd.state = ServerState::Promised;
        cd.inner.clone()
    };
    let weak = WeakElem::from_elem(elem);
    let arena = elem.arena().clone();
    let next: NextPromiseFactory = Box::new(move |md2| {
        if let Some(elem) = weak.upgrade() {
            let cb = {
                // Safety: combiner held; type matches init_call_data
                let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
                cd.recv_initial_cb.take()
            };
            if let Some(cb) = cb {
                cb(Ok(md2));
            }
        }
        ArenaBox::new(&arena, TrailingCapture {
            elem: weak.clone(),
        })
        .erase(|p| p as &mut dyn Promise)
    });
    let promise = inner.make_call_promise(
        elem.arena(),
        CallPromiseArgs {
            initial_metadata: md,
            server_initial_metadata: None,
        },
        next,
    );
    {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
        cd.promise = Some(promise);
    }
    server_poll_loop(elem);
}

/// Resolves when the application's trailing metadata has been captured
struct TrailingCapture {
    elem: WeakElem,
}

impl Promise for TrailingCapture {
    fn poll(&mut self, _activity: &mut Activity<'_>) -> Poll<Metadata> {
        match self.elem.upgrade() {
            Some(elem) => {
                // Safety: polled inside the combiner; type matches
                // init_call_data
                let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
                match cd.captured_trailing.take() {
                    Some(md) => Poll::Ready(md),
                    None => Poll::Pending,
                }
            }
            None => Poll::Pending,
        }
    }
}

fn server_poll_loop(elem: &CallElem) {
    {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
        if cd.polling {
            return;
        }
        cd.polling = true;
    }
    loop {
        let promise = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
            cd.promise.take()
        };
        let Some(mut promise) = promise else {
            break;
        };
        let wake_fn = {
            // Safety: combiner held; type matches init_call_data
            let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
            cd.wake_fn.clone()
        };
        let mut activity = Activity::new(elem.call_stack(), &wake_fn);
        match promise.poll(&mut activity) {
            Poll::Ready(trailing) => {
                drop(promise);
                server_finish(elem, trailing);
                break;
            }
            Poll::Pending => {
                // Safety: combiner held; type matches init_call_data
                let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
                if cd.state != ServerState::Cancelled {
                    cd.promise = Some(promise);
                }
            }
        }
        if !activity.should_repoll() {
            break;
        }
    }
    // Safety: combiner held; type matches init_call_data
    let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
    cd.polling = false;
}

fn server_finish(elem: &CallElem, trailing: Metadata) {
    let on_complete = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
        cd.state = ServerState::Responded;
        cd.captured_on_complete.take()
    };
    let mut batch = Batch::new();
    batch.send_trailing_metadata = Some(trailing);
    batch.on_complete = on_complete;
    elem.forward(batch);
}

fn server_cancel(elem: &CallElem, status: Status) {
    let cleanup = {
        // Safety: combiner held; type matches init_call_data
        let cd = unsafe { &mut *elem.call_data_ptr::<ServerCallData>() };
        if cd.state == ServerState::Cancelled {
            None
        } else {
            cd.state = ServerState::Cancelled;
            cd.cancel_error = Some(status.clone());
            Some((
                cd.recv_initial_cb.take(),
                cd.captured_on_complete.take(),
                cd.promise.take(),
            ))
        }
    };
    let Some((initial_cb, on_complete, promise)) = cleanup else {
        return;
    };
    drop(promise);
    if let Some(cb) = initial_cb {
        cb(Err(status.clone()));
    }
    if let Some(on_complete) = on_complete {
        on_complete.run(Err(status));
    }
}
