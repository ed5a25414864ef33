//! Runtime benchmarks using criterion.
//!
//! Measures interpreter throughput on long sequential chains, fork/join
//! fan-out, contended STM commits and queue hand-off between two fibers.
//!
//! Run with: cargo bench --bench runtime_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skein::{Effect, Queue, Runtime, RuntimeConfig, TRef};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked())
}

fn chain(n: u64) -> Effect<u64> {
    Effect::succeed(n).flat_map(|n| if n == 0 { Effect::succeed(0) } else { chain(n - 1) })
}

/// Benchmark sequential flat_map chains
fn bench_flat_map_chain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("flat_map_chain");

    for depth in [1_000u64, 10_000, 100_000] {
        group.throughput(Throughput::Elements(depth));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| black_box(rt.run_blocking(chain(depth))));
        });
    }

    group.finish();
}

/// Benchmark forking and joining many small fibers
fn bench_fork_join(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fork_join");

    for fibers in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(fibers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fibers), &fibers, |b, &fibers| {
            b.iter(|| {
                let program = Effect::foreach_par(0..fibers, |i| Effect::succeed(i * 2));
                black_box(rt.run_blocking(program))
            });
        });
    }

    group.finish();
}

/// Benchmark contended commits on a single transactional counter
fn bench_stm_counter(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("stm_counter");

    for writers in [1usize, 4, 16] {
        group.throughput(Throughput::Elements((writers * 100) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(writers), &writers, |b, &writers| {
            b.iter(|| {
                let counter = TRef::new(0u64);
                let bump = counter.update(|n| n + 1).commit().repeat_n(99);
                let program = Effect::foreach_par(0..writers, move |_| bump.clone());
                black_box(rt.run_blocking(program))
            });
        });
    }

    group.finish();
}

/// Benchmark hand-off through a bounded queue
fn bench_queue_ping_pong(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_ping_pong");
    let messages = 1_000u64;
    group.throughput(Throughput::Elements(messages));

    for capacity in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            b.iter(|| {
                let program = Queue::<u64>::bounded(capacity).flat_map(move |queue| {
                    let producer = Effect::foreach(0..messages, {
                        let queue = queue.clone();
                        move |n| queue.offer(n)
                    });
                    let consumer = Effect::foreach(0..messages, {
                        let queue = queue.clone();
                        move |_| queue.take()
                    });
                    producer.zip_par(consumer)
                });
                black_box(rt.run_blocking(program))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_flat_map_chain,
    bench_fork_join,
    bench_stm_counter,
    bench_queue_ping_pong,
);
criterion_main!(benches);
