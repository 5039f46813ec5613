//! Thread pool behavior tests
//!
//! These exercise the pool through its public surface only: submission
//! routing, ordering, stealing, scaling, fork cycles, and quiesce.

use lattice_core::notify::Notification;
use lattice_executor::pool::{PoolConfig, WorkStealingPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn small_pool(threads: usize) -> WorkStealingPool {
    WorkStealingPool::new(PoolConfig::default().reserve_threads(threads))
}

#[test]
fn can_run_closure() {
    let pool = small_pool(8);
    let done = Arc::new(Notification::new());
    let done2 = done.clone();
    pool.run(move || done2.notify());
    done.wait();
    pool.quiesce();
}

#[test]
fn same_thread_submissions_run_lifo() {
    let pool = small_pool(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Notification::new());

    let pool = Arc::new(pool);
    let pool2 = pool.clone();
    let order2 = order.clone();
    let done2 = done.clone();
    pool.run(move || {
        // Submissions from a pool thread land on its local queue; the
        // worker drains it newest-first after this closure returns.
        for label in 1..=3u32 {
            let order = order2.clone();
            let done = done2.clone();
            pool2.run(move || {
                let mut order = order.lock().unwrap();
                order.push(label);
                if order.len() == 3 {
                    done.notify();
                }
            });
        }
    });
    done.wait();
    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    pool.quiesce();
}

#[test]
fn cross_thread_submissions_run_fifo() {
    let pool = small_pool(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Notification::new());

    for label in 1..=3u32 {
        let order = order.clone();
        let done = done.clone();
        pool.run(move || {
            let mut order = order.lock().unwrap();
            order.push(label);
            if order.len() == 3 {
                done.notify();
            }
        });
    }
    done.wait();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    pool.quiesce();
}

#[test]
fn idle_worker_steals_from_busy_peer() {
    let pool = Arc::new(small_pool(2));
    let stolen = Arc::new(AtomicUsize::new(0));

    let observed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Notification::new());
    let pool2 = pool.clone();
    let stolen2 = stolen.clone();
    let observed2 = observed.clone();
    let done2 = done.clone();
    pool.run(move || {
        // Fill this worker's local queue from its own continuation, then
        // hold the worker hostage; the peer must steal.
        for _ in 0..100 {
            let stolen = stolen2.clone();
            pool2.run(move || {
                stolen.fetch_add(1, Ordering::Relaxed);
            });
        }
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(100) {
            if stolen2.load(Ordering::Relaxed) > 0 {
                break;
            }
            std::hint::spin_loop();
        }
        observed2.store(stolen2.load(Ordering::Relaxed), Ordering::Relaxed);
        done2.notify();
    });
    done.wait();
    assert!(
        observed.load(Ordering::Relaxed) >= 1,
        "peer worker never stole from the blocked worker's local queue"
    );
    pool.quiesce();
}

#[test]
fn fork_cycle_runs_everything_exactly_once() {
    let pool = small_pool(2);
    let a_runs = Arc::new(AtomicUsize::new(0));
    let b_runs = Arc::new(AtomicUsize::new(0));

    let a2 = a_runs.clone();
    pool.run(move || {
        a2.fetch_add(1, Ordering::Relaxed);
    });
    pool.prepare_fork();
    pool.postfork_child();
    let done = Arc::new(Notification::new());
    let done2 = done.clone();
    let b2 = b_runs.clone();
    pool.run(move || {
        b2.fetch_add(1, Ordering::Relaxed);
        done2.notify();
    });
    done.wait();
    pool.quiesce();
    assert_eq!(a_runs.load(Ordering::Relaxed), 1);
    assert_eq!(b_runs.load(Ordering::Relaxed), 1);
}

#[test]
fn survives_fork_while_closure_is_running() {
    let pool = Arc::new(small_pool(2));
    let inner_ran = Arc::new(Notification::new());

    let pool2 = pool.clone();
    let inner2 = inner_ran.clone();
    pool.run(move || {
        std::thread::sleep(Duration::from_millis(100));
        pool2.run(move || {
            inner2.notify();
        });
    });
    // The worker is mid-closure; prepare_fork must wait for it, save any
    // unrun work, and the restarted pool must run it.
    pool.prepare_fork();
    pool.postfork_child();
    inner_ran.wait();
    pool.quiesce();
}

#[test]
fn fork_stress() {
    const EXPECTED_RUNS: usize = 200;
    const RUNS_BETWEEN_FORKS: usize = 50;
    let pool = Arc::new(small_pool(4));
    let runs = Arc::new(AtomicUsize::new(0));
    let forks = Arc::new(AtomicUsize::new(0));

    struct Reschedule {
        pool: Arc<WorkStealingPool>,
        runs: Arc<AtomicUsize>,
        forks: Arc<AtomicUsize>,
    }
    impl Reschedule {
        fn submit(self: &Arc<Self>) {
            let this = self.clone();
            self.pool.run(move || {
                let count = this.runs.load(Ordering::Relaxed);
                if count >= EXPECTED_RUNS {
                    return;
                }
                // Hold progress until the main thread has forked enough.
                if this.forks.load(Ordering::Relaxed) * RUNS_BETWEEN_FORKS <= count {
                    this.submit();
                    return;
                }
                this.runs.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
    let state = Arc::new(Reschedule {
        pool: pool.clone(),
        runs: runs.clone(),
        forks: forks.clone(),
    });
    for _ in 0..EXPECTED_RUNS {
        state.submit();
    }
    while runs.load(Ordering::Relaxed) < EXPECTED_RUNS {
        std::thread::sleep(Duration::from_millis(20));
        let count = runs.load(Ordering::Relaxed);
        if forks.load(Ordering::Relaxed) * RUNS_BETWEEN_FORKS > count {
            continue;
        }
        pool.prepare_fork();
        pool.postfork_child();
        forks.fetch_add(1, Ordering::Relaxed);
    }
    assert!(forks.load(Ordering::Relaxed) >= EXPECTED_RUNS / RUNS_BETWEEN_FORKS);
    pool.quiesce();
}

#[test]
fn scales_when_backlogged_from_global_queue() {
    let reserve = 4;
    let pool = small_pool(reserve);
    let signal = Arc::new(Notification::new());
    let signaled = Arc::new(AtomicBool::new(false));
    let waiters = Arc::new(AtomicUsize::new(0));

    for _ in 0..reserve {
        let signal = signal.clone();
        let signaled = signaled.clone();
        let waiters = waiters.clone();
        pool.run(move || {
            waiters.fetch_add(1, Ordering::Relaxed);
            while !signaled.load(Ordering::Relaxed) {
                signal.wait_timeout(Duration::from_millis(50));
            }
        });
    }
    while waiters.load(Ordering::Relaxed) != reserve {
        std::thread::sleep(Duration::from_millis(10));
    }
    // Every reserve thread is blocked; this closure can only run on a
    // thread the lifeguard starts.
    let signal2 = signal.clone();
    let signaled2 = signaled.clone();
    pool.run(move || {
        signaled2.store(true, Ordering::Relaxed);
        signal2.notify();
    });
    pool.quiesce();
    assert!(signaled.load(Ordering::Relaxed));
}

#[test]
fn reserve_one_pool_rate_limits_thread_starts() {
    let pool = small_pool(1);
    let release = Arc::new(Notification::new());

    // Hold the only worker.
    let release2 = release.clone();
    pool.run(move || {
        release2.wait();
    });
    // Pile on work that has nowhere to run.
    for _ in 0..16 {
        pool.run(|| {});
    }
    std::thread::sleep(Duration::from_millis(400));
    // Inside the first throttle window at most one non-initial thread may
    // have started.
    assert!(
        pool.living_thread_count() <= 2,
        "started too many threads inside the throttle window"
    );
    release.notify();
    pool.quiesce();
}

#[test]
fn can_schedule_many_recursive_closures() {
    fn schedule_twice_until_zero(
        pool: &Arc<WorkStealingPool>,
        runs: &Arc<AtomicUsize>,
        n: usize,
    ) {
        runs.fetch_add(1, Ordering::Relaxed);
        if n == 0 {
            return;
        }
        let pool2 = pool.clone();
        let runs2 = runs.clone();
        pool.run(move || {
            schedule_twice_until_zero(&pool2, &runs2, n - 1);
            schedule_twice_until_zero(&pool2, &runs2, n - 1);
        });
    }

    let pool = Arc::new(small_pool(8));
    let runs = Arc::new(AtomicUsize::new(0));
    schedule_twice_until_zero(&pool, &runs, 12);
    pool.quiesce();
    assert_eq!(runs.load(Ordering::Relaxed), (1 << 13) - 1);
}

#[test]
fn quiesce_drains_all_queued_work() {
    let pool = small_pool(2);
    let runs = Arc::new(AtomicUsize::new(0));
    const N: usize = 500;
    for _ in 0..N {
        let runs = runs.clone();
        pool.run(move || {
            runs.fetch_add(1, Ordering::Relaxed);
        });
    }
    pool.quiesce();
    assert_eq!(runs.load(Ordering::Relaxed), N);
    assert_eq!(pool.living_thread_count(), 0);
}

#[test]
fn can_quiesce_from_inside_a_closure() {
    let pool = Arc::new(small_pool(4));
    let done = Arc::new(Notification::new());
    let pool2 = pool.clone();
    let done2 = done.clone();
    pool.run(move || {
        pool2.quiesce();
        done2.notify();
    });
    done.wait();
    assert!(pool.is_quiesced());
}
