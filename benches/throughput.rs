//! Queue and pool throughput benchmarks
//!
//! Includes the balanced-vs-skewed comparison that motivates work
//! stealing: with 90% of the load pinned to one worker, enabling stealing
//! should recover most of the lost parallelism.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use gantry::job::{Job, JobBuilder};
use gantry::pool::{PoolConfig, WorkerPool};
use gantry::queue::BackpressureQueue;
use gantry::stealing::WorkStealingConfig;

fn bench_queue_ops(c: &mut Criterion) {
    c.bench_function("queue/enqueue_dequeue", |b| {
        let queue = BackpressureQueue::with_capacity(100_000).unwrap();
        b.iter(|| {
            queue
                .enqueue(Job::new("bench", Box::new(|| Ok(()))))
                .unwrap();
            queue.try_dequeue().unwrap();
        });
    });
}

fn run_pool(stealing: WorkStealingConfig, jobs: usize, skewed: bool) {
    let pool = WorkerPool::new(
        "bench",
        PoolConfig {
            worker_count: 4,
            queue_capacity: jobs + 16,
            wake_interval: Duration::from_millis(1),
            shutdown_timeout: Duration::from_secs(30),
            stealing,
            ..Default::default()
        },
    )
    .unwrap();
    pool.start().unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..jobs {
        let done = done.clone();
        let job = JobBuilder::new()
            .work(move || {
                let mut acc = 0u64;
                for j in 0..5_000u64 {
                    acc = acc.wrapping_add(j);
                }
                std::hint::black_box(acc);
                done.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .build()
            .unwrap();
        if skewed && i % 10 != 0 {
            pool.submit_local(job, 0).unwrap();
        } else {
            pool.submit(job).unwrap();
        }
    }
    while done.load(Ordering::Relaxed) < jobs {
        std::thread::yield_now();
    }
    pool.stop(true).unwrap();
}

fn bench_pool_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/skewed_load");
    group.sample_size(10);
    for (label, stealing) in [
        ("no_stealing", WorkStealingConfig::default()),
        ("stealing", WorkStealingConfig::enabled()),
        ("stealing_batched", WorkStealingConfig::batch_optimized()),
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(label),
            &stealing,
            |b, stealing| {
                b.iter(|| run_pool(stealing.clone(), 5_000, true));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_queue_ops, bench_pool_throughput);
criterion_main!(benches);
