//! Stress demo - flood the pool and cycle a simulated fork
//!
//! Usage: stress [num_closures]

use lattice::{PoolConfig, WorkStealingPool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn main() {
    println!("=== lattice stress demo ===\n");

    let num_closures: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100_000);

    let pool = Arc::new(WorkStealingPool::new(PoolConfig::default()));
    let completed = Arc::new(AtomicU64::new(0));

    println!("submitting {} closures...", num_closures);
    let start = Instant::now();
    for _ in 0..num_closures {
        let completed = completed.clone();
        pool.run(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }
    let submit_time = start.elapsed();
    println!("submit time: {:?}", submit_time);
    println!(
        "submit rate: {:.0} closures/sec",
        num_closures as f64 / submit_time.as_secs_f64()
    );

    // Fork cycle mid-flight: all workers wind down, queued work survives,
    // the restarted pool finishes the backlog.
    println!("\nsimulating fork...");
    pool.prepare_fork();
    println!("prepare_fork complete ({} threads)", pool.living_thread_count());
    pool.postfork_child();
    println!("postfork complete ({} threads)", pool.living_thread_count());

    pool.quiesce();
    let total = completed.load(Ordering::Relaxed);
    println!("\ncompleted {} / {} closures", total, num_closures);
    assert_eq!(total as usize, num_closures);
    println!("elapsed: {:?}", start.elapsed());
}
