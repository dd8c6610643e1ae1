// parallex: scheduler throughput benchmarks
// Measures end-to-end dispatch/drain latency for independent-iteration jobs
// across pool sizes and iteration counts.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parallex::{PoolConfig, RawScope, ThreadPool};

static COUNTER: AtomicI64 = AtomicI64::new(0);

fn independent_body(i: i64, _scope: RawScope) {
    COUNTER.fetch_add(i, Ordering::Relaxed);
}

fn bench_independent_iterations(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_independent_iterations");
    group.significance_level(0.01);

    for &iterations in &[100i64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(iterations as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(iterations),
            &iterations,
            |b, &iterations| {
                b.iter(|| {
                    let pool = Arc::new(ThreadPool::new(PoolConfig::default()));
                    let ok = pool.enqueue_task(
                        independent_body,
                        None,
                        None,
                        RawScope::null(),
                        RawScope::null(),
                        0,
                        1,
                        iterations,
                    );
                    black_box(ok)
                });
            },
        );
    }

    group.finish();
}

fn bench_worker_count_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_worker_count_scaling");

    for &workers in &[1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| {
                let pool = Arc::new(ThreadPool::new(PoolConfig { worker_count: workers }));
                let ok = pool.enqueue_task(
                    independent_body,
                    None,
                    None,
                    RawScope::null(),
                    RawScope::null(),
                    0,
                    1,
                    5_000,
                );
                black_box(ok)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_independent_iterations, bench_worker_count_scaling);
criterion_main!(benches);
