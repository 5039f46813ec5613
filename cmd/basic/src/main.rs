//! Basic demo - submit closures, watch them run, quiesce
//!
//! Run with LATTICE_LOG_LEVEL=3 to see the pool's own logging.

use lattice::{Notification, PoolConfig, WorkStealingPool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn main() {
    println!("=== lattice basic demo ===\n");

    let pool = Arc::new(WorkStealingPool::new(PoolConfig::default()));
    println!("started pool with {} threads", pool.living_thread_count());

    let completed = Arc::new(AtomicU64::new(0));
    let done = Arc::new(Notification::new());

    // A closure that submits more work from inside the pool: those go to
    // the submitting worker's local queue.
    let pool2 = pool.clone();
    let completed2 = completed.clone();
    let done2 = done.clone();
    pool.run(move || {
        for i in 0..8 {
            let completed = completed2.clone();
            let done = done2.clone();
            pool2.run(move || {
                println!("closure {} on {:?}", i, std::thread::current().name());
                if completed.fetch_add(1, Ordering::Relaxed) + 1 == 8 {
                    done.notify();
                }
            });
        }
    });

    done.wait();
    println!("\nall {} closures ran; quiescing", completed.load(Ordering::Relaxed));
    pool.quiesce();
    println!("pool quiesced cleanly");
}
