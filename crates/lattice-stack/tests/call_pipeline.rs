//! End-to-end call pipeline tests
//!
//! A loopback transport completes receive ops with canned server
//! responses, letting full client stacks (promise adapter, a plain
//! counting filter, the terminal transport filter) run to completion
//! without a network.

use lattice_core::arena::{Arena, ArenaBox};
use lattice_core::args::ChannelArgs;
use lattice_core::closure::Closure;
use lattice_core::error::{CoreResult, Status, StatusCode};
use lattice_core::latch::Latch;
use lattice_stack::batch::{Batch, RecvMessageCallback, RecvMetadataCallback};
use lattice_stack::builder::StackBuilder;
use lattice_stack::call_stack::{CallArgs, CallElem, CallStack};
use lattice_stack::filter::Filter;
use lattice_stack::metadata::Metadata;
use lattice_stack::promise::{
    Activity, CallPromise, CallPromiseArgs, ClientPromiseFilter, NextPromiseFactory, Poll,
    Promise, PromiseFilter, ServerPromiseFilter,
};
use lattice_stack::transport::{set_transport, Transport, TransportFilter, TransportOp};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn log_of(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

// ---------------------------------------------------------------------------
// Loopback transport: replies to every completed request inline

#[derive(Default)]
struct LoopbackStream {
    recv_initial: Option<RecvMetadataCallback>,
    recv_message: Option<RecvMessageCallback>,
    recv_trailing: Option<RecvMetadataCallback>,
    cancelled: bool,
}

struct LoopbackTransport {
    log: Log,
    server_initial: Metadata,
    server_trailing: Metadata,
    /// When set, receives are held forever (until cancel)
    blackhole: bool,
}

impl LoopbackTransport {
    fn new(log: Log) -> Arc<Self> {
        let mut server_initial = Metadata::new();
        server_initial.append("server", "loopback");
        let mut server_trailing = Metadata::new();
        server_trailing.append("outcome", "done");
        Arc::new(LoopbackTransport {
            log,
            server_initial,
            server_trailing,
            blackhole: false,
        })
    }

    fn blackhole(log: Log) -> Arc<Self> {
        Arc::new(LoopbackTransport {
            log,
            server_initial: Metadata::new(),
            server_trailing: Metadata::new(),
            blackhole: true,
        })
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn init_stream(
        &self,
        _arena: &Arc<Arena>,
        _server_call: bool,
    ) -> CoreResult<Box<dyn Any + Send>> {
        self.log.lock().unwrap().push("init_stream".to_string());
        Ok(Box::new(LoopbackStream::default()))
    }

    fn perform_stream_op(&self, stream: &mut Box<dyn Any + Send>, batch: Batch) {
        let s = stream.downcast_mut::<LoopbackStream>().unwrap();
        let mut batch = batch;
        if let Some(status) = batch.cancel_stream.take() {
            self.log
                .lock()
                .unwrap()
                .push(format!("cancel:{}", status.code()));
            s.cancelled = true;
            for cb in s.recv_initial.take() {
                cb(Err(status.clone()));
            }
            for cb in s.recv_message.take() {
                cb(Err(status.clone()));
            }
            for cb in s.recv_trailing.take() {
                cb(Err(status.clone()));
            }
            batch.fail_all(&status);
            return;
        }
        if s.cancelled {
            batch.fail_all(&Status::cancelled("stream cancelled"));
            return;
        }
        if let Some(md) = batch.send_initial_metadata.take() {
            let keys: Vec<String> = md.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            self.log
                .lock()
                .unwrap()
                .push(format!("send_initial[{}]", keys.join(",")));
        }
        if let Some(msg) = batch.send_message.take() {
            self.log
                .lock()
                .unwrap()
                .push(format!("send_message[{}b]", msg.len()));
        }
        if let Some(cb) = batch.recv_initial_metadata.take() {
            s.recv_initial = Some(cb);
        }
        if let Some(cb) = batch.recv_message.take() {
            s.recv_message = Some(cb);
        }
        if let Some(cb) = batch.recv_trailing_metadata.take() {
            s.recv_trailing = Some(cb);
        }
        let finished = batch.send_close_from_client;
        if let Some(cb) = batch.on_complete.take() {
            cb.run(Ok(()));
        }
        if finished && !self.blackhole {
            self.log.lock().unwrap().push("replying".to_string());
            if let Some(cb) = s.recv_initial.take() {
                cb(Ok(self.server_initial.clone()));
            }
            if let Some(cb) = s.recv_message.take() {
                cb(Ok(Some(b"pong".to_vec())));
            }
            if let Some(cb) = s.recv_trailing.take() {
                cb(Ok(self.server_trailing.clone()));
            }
        }
    }

    fn perform_op(&self, op: TransportOp) {
        if let Some(status) = op.disconnect_with_error {
            self.log
                .lock()
                .unwrap()
                .push(format!("disconnect:{}", status.code()));
        }
        if let Some(done) = op.on_consumed {
            done.run();
        }
    }

    fn destroy_stream(&self, _stream: Box<dyn Any + Send>, then: Option<Closure>) {
        self.log.lock().unwrap().push("destroy_stream".to_string());
        if let Some(then) = then {
            then.run();
        }
    }
}

// ---------------------------------------------------------------------------
// A plain pass-through filter that counts batches

#[derive(Debug)]
struct CountingFilter {
    batches: Arc<AtomicUsize>,
}

impl Filter for CountingFilter {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn start_batch(&self, elem: &CallElem, batch: Batch) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        elem.forward(batch);
    }
}

// ---------------------------------------------------------------------------
// Promise filters under test

/// Adds a header on the way out and records the observed server initial
/// metadata and trailing metadata
struct ObservingFilter {
    log: Log,
}

struct ObservingPromise {
    log: Log,
    next: Option<NextPromiseFactory>,
    initial_metadata: Option<Metadata>,
    latch: Option<Arc<Latch<Metadata>>>,
    inner: Option<CallPromise>,
}

impl Promise for ObservingPromise {
    fn poll(&mut self, activity: &mut Activity<'_>) -> Poll<Metadata> {
        if let Some(next) = self.next.take() {
            let mut md = self.initial_metadata.take().unwrap();
            md.append("x-observed", "yes");
            self.inner = Some(next(md));
        }
        if let Some(latch) = &self.latch {
            if let Some(server_md) = latch.poll() {
                self.log.lock().unwrap().push(format!(
                    "observed_initial:{}",
                    server_md.get("server").unwrap_or("?")
                ));
            }
        }
        match self.inner.as_mut().unwrap().poll(activity) {
            Poll::Ready(mut trailing) => {
                trailing.append("x-filtered", "yes");
                self.log.lock().unwrap().push("promise_done".to_string());
                Poll::Ready(trailing)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl PromiseFilter for ObservingFilter {
    fn name(&self) -> &'static str {
        "observing"
    }

    fn examines_server_initial_metadata(&self) -> bool {
        true
    }

    fn make_call_promise(
        &self,
        arena: &Arc<Arena>,
        args: CallPromiseArgs,
        next: NextPromiseFactory,
    ) -> CallPromise {
        ArenaBox::new(arena, ObservingPromise {
            log: self.log.clone(),
            next: Some(next),
            initial_metadata: Some(args.initial_metadata),
            latch: args.server_initial_metadata,
            inner: None,
        })
        .erase(|p| p as &mut dyn Promise)
    }
}

/// Rejects the call before ever contacting the transport
struct RejectingFilter;

struct RejectingPromise;

impl Promise for RejectingPromise {
    fn poll(&mut self, _activity: &mut Activity<'_>) -> Poll<Metadata> {
        let mut trailing = Metadata::new();
        trailing.set_status(StatusCode::Unauthenticated);
        trailing.set_status_message("no credentials");
        Poll::Ready(trailing)
    }
}

impl PromiseFilter for RejectingFilter {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    fn make_call_promise(
        &self,
        arena: &Arc<Arena>,
        _args: CallPromiseArgs,
        _next: NextPromiseFactory,
    ) -> CallPromise {
        ArenaBox::new(arena, RejectingPromise).erase(|p| p as &mut dyn Promise)
    }
}

/// Forwards downstream, then times the call out on its second poll
struct EarlyReturnFilter;

struct EarlyReturnPromise {
    next: Option<NextPromiseFactory>,
    initial_metadata: Option<Metadata>,
    inner: Option<CallPromise>,
    polls: usize,
}

impl Promise for EarlyReturnPromise {
    fn poll(&mut self, activity: &mut Activity<'_>) -> Poll<Metadata> {
        if let Some(next) = self.next.take() {
            self.inner = Some(next(self.initial_metadata.take().unwrap()));
        }
        self.polls += 1;
        if let Poll::Ready(trailing) = self.inner.as_mut().unwrap().poll(activity) {
            return Poll::Ready(trailing);
        }
        if self.polls >= 2 {
            // give up on the transport
            let mut trailing = Metadata::new();
            trailing.set_status(StatusCode::Cancelled);
            trailing.set_status_message("deadline exceeded");
            return Poll::Ready(trailing);
        }
        activity.force_immediate_repoll();
        Poll::Pending
    }
}

impl PromiseFilter for EarlyReturnFilter {
    fn name(&self) -> &'static str {
        "early-return"
    }

    fn make_call_promise(
        &self,
        arena: &Arc<Arena>,
        args: CallPromiseArgs,
        next: NextPromiseFactory,
    ) -> CallPromise {
        ArenaBox::new(arena, EarlyReturnPromise {
            next: Some(next),
            initial_metadata: Some(args.initial_metadata),
            inner: None,
            polls: 0,
        })
        .erase(|p| p as &mut dyn Promise)
    }
}

// ---------------------------------------------------------------------------
// Helpers

fn client_stack(
    transport: Arc<dyn Transport>,
    promise_filter: Arc<dyn PromiseFilter>,
    batches: &Arc<AtomicUsize>,
) -> Arc<lattice_stack::channel_stack::ChannelStack> {
    let args = set_transport(&ChannelArgs::new(), transport);
    let mut builder = StackBuilder::new("client");
    builder
        .register(ClientPromiseFilter::new(promise_filter))
        .before_all();
    builder.register(Arc::new(CountingFilter {
        batches: batches.clone(),
    }));
    builder.register(Arc::new(TransportFilter)).terminal();
    builder.build(args).unwrap()
}

struct CallOutcome {
    initial: Arc<Mutex<Option<CoreResult<Metadata>>>>,
    message: Arc<Mutex<Option<CoreResult<Option<Vec<u8>>>>>>,
    trailing: Arc<Mutex<Option<CoreResult<Metadata>>>>,
    completed: Arc<Mutex<Option<CoreResult<()>>>>,
}

impl CallOutcome {
    fn new() -> Self {
        CallOutcome {
            initial: Arc::new(Mutex::new(None)),
            message: Arc::new(Mutex::new(None)),
            trailing: Arc::new(Mutex::new(None)),
            completed: Arc::new(Mutex::new(None)),
        }
    }

    /// A full unary request batch wired to this outcome
    fn request_batch(&self) -> Batch {
        let mut md = Metadata::new();
        md.append("path", "/echo");
        let mut batch = Batch::new();
        batch.send_initial_metadata = Some(md);
        batch.send_message = Some(b"ping".to_vec());
        batch.send_close_from_client = true;
        let slot = self.initial.clone();
        batch.recv_initial_metadata = Some(Box::new(move |r| {
            *slot.lock().unwrap() = Some(r);
        }));
        let slot = self.message.clone();
        batch.recv_message = Some(Box::new(move |r| {
            *slot.lock().unwrap() = Some(r);
        }));
        let slot = self.trailing.clone();
        batch.recv_trailing_metadata = Some(Box::new(move |r| {
            *slot.lock().unwrap() = Some(r);
        }));
        let slot = self.completed.clone();
        batch.on_complete = Some(lattice_core::closure::StatusClosure::new(move |r| {
            *slot.lock().unwrap() = Some(r);
        }));
        batch
    }
}

// ---------------------------------------------------------------------------
// Tests

#[test]
fn unary_call_completes_through_promise_pipeline() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let batches = Arc::new(AtomicUsize::new(0));
    let transport = LoopbackTransport::new(log.clone());
    let stack = client_stack(
        transport,
        Arc::new(ObservingFilter {
            log: log.clone(),
        }),
        &batches,
    );
    assert_eq!(
        stack.filter_names(),
        vec!["observing", "counting", "transport"]
    );

    let call = CallStack::new(&stack, CallArgs::new("/echo")).unwrap();
    let outcome = CallOutcome::new();
    call.start_batch(outcome.request_batch());

    // send path reached the transport with the filter's header
    let events = log_of(&log);
    assert!(events
        .iter()
        .any(|e| e.starts_with("send_initial") && e.contains("x-observed=yes")));
    assert!(events.contains(&"replying".to_string()));
    // the filter observed server initial metadata through the latch
    assert!(events.contains(&"observed_initial:loopback".to_string()));
    assert!(events.contains(&"promise_done".to_string()));

    // all completions fired
    let initial = outcome.initial.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(initial.get("server"), Some("loopback"));
    let message = outcome.message.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(message.as_deref(), Some(b"pong".as_ref()));
    let trailing = outcome.trailing.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(trailing.get("outcome"), Some("done"));
    // the promise rewrote the trailing metadata on its way up
    assert_eq!(trailing.get("x-filtered"), Some("yes"));
    assert!(outcome.completed.lock().unwrap().take().unwrap().is_ok());
    // promise engaged: the batch below us was the resumed capture
    assert_eq!(batches.load(Ordering::Relaxed), 1);
}

#[test]
fn rejecting_promise_fails_captured_batch_without_transport() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let batches = Arc::new(AtomicUsize::new(0));
    let transport = LoopbackTransport::new(log.clone());
    let stack = client_stack(transport, Arc::new(RejectingFilter), &batches);

    let call = CallStack::new(&stack, CallArgs::new("/echo")).unwrap();
    let outcome = CallOutcome::new();
    call.start_batch(outcome.request_batch());

    // the captured batch never reached the transport
    assert_eq!(batches.load(Ordering::Relaxed), 0);
    assert!(!log_of(&log).iter().any(|e| e.starts_with("send_initial")));
    // trailing metadata carries the rejection
    let trailing = outcome.trailing.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(trailing.status(), Some(StatusCode::Unauthenticated));
    // the other components failed with the derived status
    let completed = outcome.completed.lock().unwrap().take().unwrap();
    assert_eq!(completed.unwrap_err().code(), StatusCode::Unauthenticated);
    let message = outcome.message.lock().unwrap().take().unwrap();
    assert_eq!(message.unwrap_err().code(), StatusCode::Unauthenticated);
}

#[test]
fn early_promise_return_cancels_the_stream_below() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let batches = Arc::new(AtomicUsize::new(0));
    // blackhole: the transport never replies
    let transport = LoopbackTransport::blackhole(log.clone());
    let stack = client_stack(transport, Arc::new(EarlyReturnFilter), &batches);

    let call = CallStack::new(&stack, CallArgs::new("/echo")).unwrap();
    let outcome = CallOutcome::new();
    call.start_batch(outcome.request_batch());

    let events = log_of(&log);
    // the send went down, then the early return cancelled the stream with
    // the status taken from the synthesized trailing metadata
    assert!(events.iter().any(|e| e.starts_with("send_initial")));
    assert!(events.contains(&"cancel:cancelled".to_string()));
    let trailing = outcome.trailing.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(trailing.status(), Some(StatusCode::Cancelled));
    assert_eq!(trailing.status_message(), Some("deadline exceeded"));
}

#[test]
fn cancel_stream_short_circuits_all_state() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let batches = Arc::new(AtomicUsize::new(0));
    let transport = LoopbackTransport::blackhole(log.clone());
    let stack = client_stack(
        transport,
        Arc::new(ObservingFilter {
            log: log.clone(),
        }),
        &batches,
    );

    let call = CallStack::new(&stack, CallArgs::new("/echo")).unwrap();
    let outcome = CallOutcome::new();
    call.start_batch(outcome.request_batch());
    // nothing resolved yet
    assert!(outcome.trailing.lock().unwrap().is_none());

    call.cancel(Status::cancelled("user hung up"));

    let trailing = outcome.trailing.lock().unwrap().take().unwrap();
    assert_eq!(trailing.unwrap_err().code(), StatusCode::Cancelled);
    assert!(log_of(&log).contains(&"cancel:cancelled".to_string()));
}

#[test]
fn server_promise_forwards_trailing_metadata_downward() {
    // Terminal filter standing in for a server transport: delivers canned
    // client initial metadata and records what is sent down.
    #[derive(Debug)]
    struct ServerTerminal {
        log: Log,
    }
    impl Filter for ServerTerminal {
        fn name(&self) -> &'static str {
            "server-terminal"
        }
        fn start_batch(&self, _elem: &CallElem, mut batch: Batch) {
            if let Some(cb) = batch.recv_initial_metadata.take() {
                let mut md = Metadata::new();
                md.append("client", "hello");
                cb(Ok(md));
            }
            if let Some(md) = batch.send_trailing_metadata.take() {
                self.log.lock().unwrap().push(format!(
                    "send_trailing:status={:?},tag={:?}",
                    md.status(),
                    md.get("x-filtered")
                ));
            }
            if let Some(cb) = batch.on_complete.take() {
                cb.run(Ok(()));
            }
        }
    }

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut builder = StackBuilder::new("server");
    builder.register(ServerPromiseFilter::new(Arc::new(ObservingFilter {
        log: log.clone(),
    })));
    builder
        .register(Arc::new(ServerTerminal {
            log: log.clone(),
        }))
        .terminal();
    let stack = builder.build(ChannelArgs::new()).unwrap();

    let call = CallStack::new(&stack, CallArgs::new("/svc").server_call(true)).unwrap();

    // the application's receive of client initial metadata
    let got_initial: Arc<Mutex<Option<Metadata>>> = Arc::new(Mutex::new(None));
    let got2 = got_initial.clone();
    let mut batch = Batch::new();
    batch.recv_initial_metadata = Some(Box::new(move |r| {
        *got2.lock().unwrap() = Some(r.unwrap());
    }));
    call.start_batch(batch);

    // the promise engaged and passed the metadata up
    let initial = got_initial.lock().unwrap().take().unwrap();
    assert_eq!(initial.get("client"), Some("hello"));

    // the application finishes the call; the promise rewrites trailing
    // metadata before it reaches the wire
    let completed = Arc::new(Mutex::new(None));
    let completed2 = completed.clone();
    let mut trailing = Metadata::new();
    trailing.set_status(StatusCode::Internal);
    let mut batch = Batch::new();
    batch.send_trailing_metadata = Some(trailing);
    batch.on_complete = Some(lattice_core::closure::StatusClosure::new(move |r| {
        *completed2.lock().unwrap() = Some(r);
    }));
    call.start_batch(batch);

    let events = log_of(&log);
    assert!(events.contains(&"promise_done".to_string()));
    assert!(events
        .iter()
        .any(|e| e.contains("send_trailing") && e.contains("tag=Some(\"yes\")")));
    assert!(completed.lock().unwrap().take().unwrap().is_ok());
}

#[test]
fn calls_run_concurrently_on_the_pool() {
    use lattice_executor::pool::{PoolConfig, WorkStealingPool};

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let batches = Arc::new(AtomicUsize::new(0));
    let transport = LoopbackTransport::new(log.clone());
    let stack = client_stack(
        transport,
        Arc::new(ObservingFilter {
            log: log.clone(),
        }),
        &batches,
    );

    let pool = WorkStealingPool::new(PoolConfig::default().reserve_threads(4));
    let done = Arc::new(AtomicUsize::new(0));
    const CALLS: usize = 32;
    for _ in 0..CALLS {
        let stack = stack.clone();
        let done = done.clone();
        pool.run(move || {
            let call = CallStack::new(&stack, CallArgs::new("/echo")).unwrap();
            let outcome = CallOutcome::new();
            call.start_batch(outcome.request_batch());
            assert!(outcome.trailing.lock().unwrap().take().unwrap().is_ok());
            done.fetch_add(1, Ordering::Relaxed);
        });
    }
    pool.quiesce();
    assert_eq!(done.load(Ordering::Relaxed), CALLS);
    assert_eq!(batches.load(Ordering::Relaxed), CALLS);
}
