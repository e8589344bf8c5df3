//! Throughput benchmarks for the mutation queue.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use state_queue::{ContainerConfig, MutationQueue, SetOperation, StateContainer};
use std::time::Duration;

/// Benchmark enqueue + drain of set batches of varying size
fn bench_queue_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_drain");

    for batch in [1, 16, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            let queue: MutationQueue<u64> = MutationQueue::new();
            b.iter(|| {
                for _ in 0..batch {
                    let op: SetOperation<u64> = Box::new(|s: &u64| Ok(s + 1));
                    let _ = queue.enqueue_set(op);
                }
                black_box(queue.drain_all_sets());
            });
        });
    }

    group.finish();
}

/// Benchmark manual passes over bursts of transforms
fn bench_manual_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("manual_pass");

    for burst in [1, 64, 1024] {
        group.bench_with_input(BenchmarkId::new("burst", burst), &burst, |b, &burst| {
            let container =
                StateContainer::with_config(0u64, ContainerConfig::manual()).unwrap();
            b.iter(|| {
                for _ in 0..burst {
                    container.submit_transform(|s| s + 1);
                }
                black_box(container.run_pending().unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark round trips through the dedicated worker
fn bench_dedicated_round_trip(c: &mut Criterion) {
    let container = StateContainer::new(0u64).unwrap();

    c.bench_function("dedicated_transform_then_query", |b| {
        b.iter(|| {
            container.submit_transform(|s| s + 1);
            let answer = container.query(|s| *s).unwrap();
            black_box(answer.recv_timeout(Duration::from_secs(5)).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_queue_drain,
    bench_manual_pass,
    bench_dedicated_round_trip
);
criterion_main!(benches);
