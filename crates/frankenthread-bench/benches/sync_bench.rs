//! Primitive fast-path benchmarks.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use frankenthread_core::sync::{Condvar, Mutex, Once};
use frankenthread_core::thread;
use frankenthread_core::tls::TlsKey;

fn bench_uncontended_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex_uncontended");

    let ours = Mutex::new(0u64);
    group.bench_function("frankenthread", |b| {
        b.iter(|| {
            *ours.lock() += 1;
        });
    });

    let reference = parking_lot::Mutex::new(0u64);
    group.bench_function("parking_lot", |b| {
        b.iter(|| {
            *reference.lock() += 1;
        });
    });

    group.finish();
}

fn bench_contended_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex_contended");
    group.sample_size(20);

    for threads in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &n| {
            b.iter(|| {
                let counter = Arc::new(Mutex::new(0u64));
                let workers: Vec<_> = (0..n)
                    .map(|_| {
                        let counter = Arc::clone(&counter);
                        thread::spawn(move || {
                            for _ in 0..1_000 {
                                *counter.lock() += 1;
                            }
                            Ok(0)
                        })
                        .expect("spawn")
                    })
                    .collect();
                for w in workers {
                    w.join().expect("join");
                }
                criterion::black_box(*counter.lock());
            });
        });
    }
    group.finish();
}

fn bench_wake_without_waiters(c: &mut Criterion) {
    let cv = Condvar::new();
    c.bench_function("condvar_wake_no_waiters", |b| {
        b.iter(|| cv.wake().expect("wake"));
    });
}

fn bench_once_completed(c: &mut Criterion) {
    let gate = Once::new();
    gate.run(|| {});
    c.bench_function("once_completed_fast_path", |b| {
        b.iter(|| gate.run(|| unreachable!()));
    });
}

fn bench_tls_get_set(c: &mut Criterion) {
    let key = TlsKey::new(None).expect("key");
    c.bench_function("tls_set_get", |b| {
        let mut n = 0usize;
        b.iter(|| {
            n = n.wrapping_add(1);
            key.set(n).expect("set");
            criterion::black_box(key.get());
        });
    });
    key.remove().expect("remove");
}

criterion_group!(
    benches,
    bench_uncontended_lock,
    bench_contended_lock,
    bench_wake_without_waiters,
    bench_once_completed,
    bench_tls_get_set
);
criterion_main!(benches);
