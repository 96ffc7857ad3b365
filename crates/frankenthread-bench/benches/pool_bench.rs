//! Worker pool throughput benchmarks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use frankenthread_core::pool::ThreadPool;
use frankenthread_core::thread;

fn bench_submit_and_wait(c: &mut Criterion) {
    const ITEMS: u64 = 1_000;
    let mut group = c.benchmark_group("pool_submit_wait");
    group.throughput(Throughput::Elements(ITEMS));

    for workers in [1usize, 2, 4, 8] {
        let pool = ThreadPool::new(workers).expect("pool");
        let sum = Arc::new(AtomicU64::new(0));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| {
                for i in 0..ITEMS {
                    let sum = Arc::clone(&sum);
                    pool.add_work(move || {
                        sum.fetch_add(i, Ordering::Relaxed);
                    })
                    .expect("add_work");
                }
                pool.wait().expect("wait");
            });
        });
        pool.destroy().expect("destroy");
    }
    group.finish();
}

fn bench_pool_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_lifecycle");
    group.sample_size(20);
    group.bench_function("init_destroy_4", |b| {
        b.iter(|| {
            let pool = ThreadPool::new(4).expect("pool");
            criterion::black_box(pool.destroy().expect("destroy"));
        });
    });
    group.bench_function("spawn_join", |b| {
        b.iter(|| {
            let t = thread::spawn(|| Ok(0)).expect("spawn");
            criterion::black_box(t.join().expect("join"));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_submit_and_wait, bench_pool_lifecycle);
criterion_main!(benches);
