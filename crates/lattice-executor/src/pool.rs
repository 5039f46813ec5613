//! Work-stealing thread pool
//!
//! An adaptive executor over a reserve of OS threads. Each worker owns a
//! local [`WorkQueue`]; submissions from a pool thread go local (LIFO for
//! the owner), submissions from outside go to a shared global queue
//! (drained FIFO). Idle workers consult local, then global, then steal
//! the oldest work from a peer through the theft registry.
//!
//! A dedicated lifeguard thread watches backlog: when every worker is
//! busy and global work is waiting, it starts one more thread, rate
//! limited to one non-initial start per second by a compare-exchange
//! throttle flag plus a timestamp window. Threads beyond the reserve
//! retire after twenty seconds of idleness.
//!
//! Fork handling follows the prepare/postfork protocol: before a fork all
//! threads are torn down and fetched-but-unrun closures return to the
//! global queue; after a fork the reserve and the lifeguard restart.
//!
//! Set `LATTICE_POOL_VERBOSE_FAILURES=1` to bound quiesce at sixty
//! seconds and dump every worker's stack before crashing if the pool
//! fails to drain.

use crate::forkable::{self, Forkable};
use crate::thread_count::{BusyThreadCount, LivingThreadCount};
use crate::work_queue::WorkQueue;
use crate::work_signal::WorkSignal;
use lattice_core::backoff::Backoff;
use lattice_core::clock;
use lattice_core::closure::Closure;
use lattice_core::env;
use lattice_core::notify::Notification;
use lattice_core::{tlog_error, tlog_info, tracelog};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Maximum time an extra thread may idle before being reclaimed
const IDLE_THREAD_LIMIT: Duration = Duration::from_secs(20);

/// Minimum time between non-initial thread starts
const TIME_BETWEEN_THROTTLED_THREAD_STARTS: Duration = Duration::from_secs(1);

/// Worker wait backoff bounds
const WORKER_MIN_SLEEP: Duration = Duration::from_millis(15);
const WORKER_MAX_SLEEP: Duration = Duration::from_secs(3);

/// Lifeguard check backoff bounds
const LIFEGUARD_MIN_SLEEP: Duration = Duration::from_millis(15);
const LIFEGUARD_MAX_SLEEP: Duration = Duration::from_secs(1);

const BACKOFF_MULTIPLIER: f64 = 1.3;

/// Bound applied to quiesce and fork waits in verbose-failures mode
const BLOCK_UNTIL_THREAD_COUNT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a [`WorkStealingPool`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of resident threads
    pub reserve_threads: usize,

    /// Dump stacks and crash when quiesce exceeds its bound
    pub verbose_failures: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        PoolConfig {
            reserve_threads: cores.clamp(2, 32),
            verbose_failures: env::is_set("LATTICE_POOL_VERBOSE_FAILURES"),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the resident thread target
    pub fn reserve_threads(mut self, n: usize) -> Self {
        self.reserve_threads = n.max(1);
        self
    }

    pub fn verbose_failures(mut self, on: bool) -> Self {
        self.verbose_failures = on;
        self
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerTls>> = const { RefCell::new(None) };
}

struct WorkerTls {
    pool: Arc<PoolState>,
    queue: Arc<WorkQueue>,
}

/// Set of local queues idle workers may steal from
struct TheftRegistry {
    queues: Mutex<Vec<Arc<WorkQueue>>>,
}

impl TheftRegistry {
    fn new() -> Self {
        TheftRegistry {
            queues: Mutex::new(Vec::new()),
        }
    }

    fn enroll(&self, queue: Arc<WorkQueue>) {
        self.queues.lock().unwrap().push(queue);
    }

    fn unenroll(&self, queue: &Arc<WorkQueue>) {
        self.queues
            .lock()
            .unwrap()
            .retain(|q| !Arc::ptr_eq(q, queue));
    }

    /// Take the oldest closure from the first queue that yields one
    fn steal_one(&self) -> Option<Closure> {
        let queues = self.queues.lock().unwrap();
        for queue in queues.iter() {
            if let Some(c) = queue.pop_oldest() {
                return Some(c);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

/// State block shared by the pool handle, every worker, and the lifeguard
///
/// Workers hold a strong reference so they may outlive the handle during
/// shutdown.
struct PoolState {
    reserve_threads: usize,
    verbose_failures: bool,
    global_queue: WorkQueue,
    theft: TheftRegistry,
    living: LivingThreadCount,
    busy: BusyThreadCount,
    work_signal: WorkSignal,
    shutdown: AtomicBool,
    forking: AtomicBool,
    quiesced: AtomicBool,
    throttled: AtomicBool,
    last_started_thread_ns: AtomicI64,
    next_worker_tag: AtomicUsize,
    lifeguard: Mutex<Option<Lifeguard>>,
    #[cfg(unix)]
    tracked_threads: Mutex<Vec<libc::pthread_t>>,
}

/// The adaptive work-stealing executor
pub struct WorkStealingPool {
    state: Arc<PoolState>,
    fork_registration: Weak<dyn Forkable>,
    // keeps the fork hook alive for the pool's lifetime
    _fork_hook: Arc<ForkHook>,
}

/// Adapter enrolling the pool state in the forkable registry
struct ForkHook {
    state: Arc<PoolState>,
}

impl Forkable for ForkHook {
    fn prepare_fork(&self) {
        self.state.prepare_fork();
    }

    fn postfork_parent(&self) {
        self.state.postfork();
    }

    fn postfork_child(&self) {
        self.state.postfork();
    }
}

impl WorkStealingPool {
    /// Create a pool and start its reserve threads plus the lifeguard
    pub fn new(config: PoolConfig) -> Self {
        tracelog::init();
        let state = Arc::new(PoolState {
            reserve_threads: config.reserve_threads,
            verbose_failures: config.verbose_failures,
            global_queue: WorkQueue::new(),
            theft: TheftRegistry::new(),
            living: LivingThreadCount::new(),
            busy: BusyThreadCount::new(),
            work_signal: WorkSignal::new(),
            shutdown: AtomicBool::new(false),
            forking: AtomicBool::new(false),
            quiesced: AtomicBool::new(false),
            throttled: AtomicBool::new(false),
            last_started_thread_ns: AtomicI64::new(0),
            next_worker_tag: AtomicUsize::new(0),
            lifeguard: Mutex::new(None),
            #[cfg(unix)]
            tracked_threads: Mutex::new(Vec::new()),
        });
        if config.verbose_failures {
            tlog_info!("thread pool verbose failures are enabled");
        }
        state.start();
        let hook = Arc::new(ForkHook {
            state: state.clone(),
        });
        let hook_dyn: Arc<dyn Forkable> = hook.clone();
        let weak: Weak<dyn Forkable> = Arc::downgrade(&hook_dyn);
        forkable::register(weak.clone());
        WorkStealingPool {
            state,
            fork_registration: weak,
            _fork_hook: hook,
        }
    }

    /// Submit a closure for execution
    ///
    /// From a pool thread the closure joins that thread's local queue;
    /// otherwise it joins the global queue. Submission after `quiesce` is
    /// a programming error.
    pub fn run(&self, f: impl FnOnce() + Send + 'static) {
        self.run_closure(Closure::new(f));
    }

    /// [`run`](WorkStealingPool::run) for an already-built closure
    pub fn run_closure(&self, closure: Closure) {
        assert!(
            !self.state.is_quiesced(),
            "WorkStealingPool::run called after quiesce"
        );
        let mut closure = Some(closure);
        CURRENT_WORKER.with(|tls| {
            if let Some(worker) = tls.borrow().as_ref() {
                if Arc::ptr_eq(&worker.pool, &self.state) {
                    worker.queue.add(closure.take().unwrap());
                }
            }
        });
        if let Some(c) = closure {
            self.state.global_queue.add(c);
        }
        // Signal even for local adds; it measurably helps saturated
        // many-core streaming workloads.
        self.state.work_signal.signal();
    }

    /// Shut the pool down and wait for every thread to drain and exit
    pub fn quiesce(&self) {
        self.state.quiesce();
    }

    pub fn is_quiesced(&self) -> bool {
        self.state.is_quiesced()
    }

    /// Number of currently living worker threads
    pub fn living_thread_count(&self) -> usize {
        self.state.living.count()
    }

    /// Tear down all threads ahead of a process fork
    pub fn prepare_fork(&self) {
        self.state.prepare_fork();
    }

    /// Restart after a fork, parent side
    pub fn postfork_parent(&self) {
        self.state.postfork();
    }

    /// Restart after a fork, child side
    pub fn postfork_child(&self) {
        self.state.postfork();
    }
}

impl Drop for WorkStealingPool {
    fn drop(&mut self) {
        forkable::unregister(&self.fork_registration);
    }
}

impl PoolState {
    fn start(self: &Arc<Self>) {
        for _ in 0..self.reserve_threads {
            self.start_thread(false);
        }
        let mut lifeguard = self.lifeguard.lock().unwrap();
        *lifeguard = Some(Lifeguard::start(self.clone()));
    }

    fn start_thread(self: &Arc<Self>, clears_throttle: bool) {
        self.last_started_thread_ns
            .store(clock::monotonic_nanos(), Ordering::Relaxed);
        // Count the thread before it exists so quiesce cannot miss it.
        self.living.increment();
        let worker = WorkerState {
            pool: self.clone(),
            busy_idx: self.busy.next_index(),
            backoff: Backoff::new(WORKER_MIN_SLEEP, WORKER_MAX_SLEEP, BACKOFF_MULTIPLIER),
            clears_throttle,
            tag: self.next_worker_tag.fetch_add(1, Ordering::Relaxed),
        };
        std::thread::Builder::new()
            .name("lattice-worker".to_string())
            .spawn(move || worker.thread_body())
            .expect("failed to spawn worker thread");
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn is_forking(&self) -> bool {
        self.forking.load(Ordering::Relaxed)
    }

    fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Relaxed)
    }

    fn set_shutdown(&self, value: bool) {
        let was = self.shutdown.swap(value, Ordering::Relaxed);
        assert_ne!(was, value, "shutdown flag toggled twice");
        self.work_signal.signal_all();
    }

    fn set_forking(&self, value: bool) {
        let was = self.forking.swap(value, Ordering::Relaxed);
        assert_ne!(was, value, "forking flag toggled twice");
    }

    fn quiesce(&self) {
        self.set_shutdown(true);
        // If this is a pool thread it cannot wait for itself to exit;
        // one living thread remains in that case.
        let on_pool_thread = CURRENT_WORKER.with(|tls| {
            tls.borrow()
                .as_ref()
                .map(|w| std::ptr::eq(Arc::as_ptr(&w.pool), self))
                .unwrap_or(false)
        });
        let target = usize::from(on_pool_thread);
        let timeout = self
            .verbose_failures
            .then_some(BLOCK_UNTIL_THREAD_COUNT_TIMEOUT);
        let drained = self.living.block_until(target, timeout, "shutting down");
        if !drained && self.verbose_failures {
            self.dump_stacks_and_crash(target);
        }
        assert!(self.global_queue.is_empty());
        if target == 0 {
            assert_eq!(self.theft.len(), 0);
        }
        self.quiesced.store(true, Ordering::Relaxed);
        let mut lifeguard = self.lifeguard.lock().unwrap();
        lifeguard.take();
    }

    fn prepare_fork(&self) {
        tlog_info!("thread pool prepare_fork");
        self.set_forking(true);
        self.work_signal.signal_all();
        let drained =
            self.living
                .block_until(0, Some(BLOCK_UNTIL_THREAD_COUNT_TIMEOUT), "forking");
        if !drained && self.verbose_failures {
            self.dump_stacks_and_crash(0);
        }
        let mut lifeguard = self.lifeguard.lock().unwrap();
        lifeguard.take();
    }

    fn postfork(self: &Arc<Self>) {
        self.set_forking(false);
        // A throttled start torn down mid-fork must not wedge the flag.
        self.throttled.store(false, Ordering::Relaxed);
        self.start();
    }

    #[cfg(unix)]
    fn track_thread(&self, tid: libc::pthread_t) {
        self.tracked_threads.lock().unwrap().push(tid);
    }

    #[cfg(unix)]
    fn untrack_thread(&self, tid: libc::pthread_t) {
        self.tracked_threads.lock().unwrap().retain(|t| *t != tid);
    }

    #[cfg(unix)]
    fn dump_stacks_and_crash(&self, ignore_threads: usize) -> ! {
        let tracked = self.tracked_threads.lock().unwrap().clone();
        tlog_error!(
            "pool did not quiesce in time; dumping all {} tracked thread stacks",
            tracked.len()
        );
        for tid in tracked {
            let _ = nix::sys::pthread::pthread_kill(tid, nix::sys::signal::Signal::SIGUSR1);
        }
        while self.living.count().saturating_sub(ignore_threads) > reported_dump_count() {
            std::thread::sleep(Duration::from_millis(200));
        }
        tlog_error!("pool did not quiesce in time; aborting");
        std::process::abort();
    }

    #[cfg(not(unix))]
    fn dump_stacks_and_crash(&self, _ignore_threads: usize) -> ! {
        tlog_error!("pool did not quiesce in time; aborting");
        std::process::abort();
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        static REPORTED_DUMP_COUNT: AtomicUsize = AtomicUsize::new(0);

        fn reported_dump_count() -> usize {
            REPORTED_DUMP_COUNT.load(Ordering::Relaxed)
        }

        extern "C" fn dump_signal_handler(_sig: libc::c_int) {
            // Crash path only: formatting is not async-signal-safe, but
            // the process is about to abort regardless.
            let trace = std::backtrace::Backtrace::force_capture();
            tlog_error!("stack dump for worker:\n{}", trace);
            REPORTED_DUMP_COUNT.fetch_add(1, Ordering::Relaxed);
        }

        fn install_dump_signal_handler() {
            use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
            static INSTALL: std::sync::Once = std::sync::Once::new();
            INSTALL.call_once(|| {
                let action = SigAction::new(
                    SigHandler::Handler(dump_signal_handler),
                    SaFlags::empty(),
                    SigSet::empty(),
                );
                // Safety: handler is installed once, before any dump is
                // requested
                unsafe {
                    let _ = sigaction(Signal::SIGUSR1, &action);
                }
            });
        }
    }
}

/// Per-thread worker state; constructed on the spawning thread so the
/// living count is visible before the worker runs
struct WorkerState {
    pool: Arc<PoolState>,
    busy_idx: usize,
    backoff: Backoff,
    clears_throttle: bool,
    tag: usize,
}

impl WorkerState {
    fn thread_body(mut self) {
        tracelog::set_thread_tag(&format!("w{}", self.tag));
        #[cfg(unix)]
        let tid = {
            if self.pool.verbose_failures {
                install_dump_signal_handler();
            }
            let tid = nix::sys::pthread::pthread_self();
            if self.pool.verbose_failures {
                self.pool.track_thread(tid);
            }
            tid
        };

        let local = Arc::new(WorkQueue::new());
        self.pool.theft.enroll(local.clone());
        CURRENT_WORKER.with(|tls| {
            *tls.borrow_mut() = Some(WorkerTls {
                pool: self.pool.clone(),
                queue: local.clone(),
            });
        });
        if self.clears_throttle {
            // Bootstrap complete; allow the next throttled start.
            self.pool.throttled.store(false, Ordering::Relaxed);
        }

        while self.step(&local) {}

        // Cleanup: a forking worker saves its queued work for the
        // post-fork threads; a shutdown worker drains everything it can
        // reach before exiting.
        if self.pool.is_forking() {
            while let Some(closure) = local.pop_most_recent() {
                self.pool.global_queue.add(closure);
            }
        } else if self.pool.is_shutdown() {
            self.finish_draining(&local);
        }
        debug_assert!(local.is_empty());
        self.pool.theft.unenroll(&local);
        CURRENT_WORKER.with(|tls| {
            tls.borrow_mut().take();
        });
        #[cfg(unix)]
        if self.pool.verbose_failures {
            self.pool.untrack_thread(tid);
        }
        self.pool.living.decrement();
    }

    /// One iteration of the worker state machine; false means exit
    fn step(&mut self, local: &Arc<WorkQueue>) -> bool {
        if self.pool.is_forking() {
            return false;
        }
        // Local work runs first, newest first.
        if let Some(closure) = local.pop_most_recent() {
            let _busy = self.pool.busy.guard(self.busy_idx);
            closure.run();
            return true;
        }
        let mut should_run_again = false;
        let mut fetched: Option<Closure> = None;
        let idle_since = Instant::now();
        // Wait until work is available or the pool winds down.
        while !self.pool.is_forking() {
            // Global next, oldest first: cross-thread submissions run in
            // submission order.
            if let Some(closure) = self.pool.global_queue.pop_oldest() {
                fetched = Some(closure);
                should_run_again = true;
                break;
            }
            if let Some(closure) = self.pool.theft.steal_one() {
                fetched = Some(closure);
                should_run_again = true;
                break;
            }
            if self.pool.is_shutdown() {
                break;
            }
            let timed_out = self
                .pool
                .work_signal
                .wait_with_timeout(self.backoff.next_delay());
            if self.pool.is_forking() || self.pool.is_shutdown() {
                break;
            }
            // Retire a surplus thread that has idled past the limit.
            if timed_out
                && self.pool.living.count() > self.pool.reserve_threads
                && idle_since.elapsed() > IDLE_THREAD_LIMIT
            {
                return false;
            }
        }
        if self.pool.is_forking() {
            // Not going to run it; save it for the post-fork pool.
            if let Some(closure) = fetched {
                local.add(closure);
            }
            return false;
        }
        if let Some(closure) = fetched {
            let _busy = self.pool.busy.guard(self.busy_idx);
            closure.run();
        }
        self.backoff.reset();
        should_run_again
    }

    /// Run everything reachable before exiting a shutdown pool
    fn finish_draining(&self, local: &Arc<WorkQueue>) {
        // Definitionally busy while draining.
        let _busy = self.pool.busy.guard(self.busy_idx);
        // A fork can interrupt the drain; post-fork threads finish it.
        while !self.pool.is_forking() {
            if let Some(closure) = local.pop_most_recent() {
                closure.run();
                continue;
            }
            if let Some(closure) = self.pool.global_queue.pop_oldest() {
                closure.run();
                continue;
            }
            break;
        }
    }
}

/// Backlog watchdog: one per pool, not a worker
struct Lifeguard {
    should_shut_down: Arc<Notification>,
    is_shut_down: Arc<Notification>,
}

impl Lifeguard {
    fn start(pool: Arc<PoolState>) -> Lifeguard {
        let should_shut_down = Arc::new(Notification::new());
        let is_shut_down = Arc::new(Notification::new());
        let should2 = should_shut_down.clone();
        let done2 = is_shut_down.clone();
        std::thread::Builder::new()
            .name("lattice-lifeguard".to_string())
            .spawn(move || lifeguard_main(pool, should2, done2))
            .expect("failed to spawn lifeguard thread");
        Lifeguard {
            should_shut_down,
            is_shut_down,
        }
    }
}

impl Drop for Lifeguard {
    fn drop(&mut self) {
        self.should_shut_down.notify();
        self.is_shut_down.wait();
    }
}

fn lifeguard_main(
    pool: Arc<PoolState>,
    should_shut_down: Arc<Notification>,
    is_shut_down: Arc<Notification>,
) {
    tracelog::set_thread_tag("lg");
    let mut backoff = Backoff::new(LIFEGUARD_MIN_SLEEP, LIFEGUARD_MAX_SLEEP, BACKOFF_MULTIPLIER);
    loop {
        if pool.is_forking() {
            break;
        }
        // Once shut down, loop quickly until quiesced; otherwise relax
        // the check rate while the pool is calm.
        if pool.is_shutdown() {
            if pool.is_quiesced() {
                break;
            }
        } else {
            should_shut_down.wait_timeout(backoff.next_delay());
        }
        maybe_start_new_thread(&pool, &mut backoff);
    }
    is_shut_down.notify();
}

fn maybe_start_new_thread(pool: &Arc<PoolState>, backoff: &mut Backoff) {
    if pool.is_forking() {
        return;
    }
    let living = pool.living.count();
    if pool.busy.count() < living {
        // Someone is idle; wake a worker if global work is waiting.
        if !pool.global_queue.is_empty() {
            pool.work_signal.signal();
            backoff.reset();
        }
        return;
    }
    if pool.global_queue.is_empty() {
        return;
    }
    let since_last_start = clock::monotonic_nanos()
        - pool.last_started_thread_ns.load(Ordering::Relaxed);
    if since_last_start < TIME_BETWEEN_THROTTLED_THREAD_STARTS.as_nanos() as i64 {
        // Throttled, but every worker is busy; stay vigilant.
        backoff.reset();
        return;
    }
    // At most one non-initial start in flight.
    if pool
        .throttled
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    tlog_info!(
        "starting new pool thread due to backlog (total threads: {})",
        living + 1
    );
    pool.start_thread(true);
    backoff.reset();
}
