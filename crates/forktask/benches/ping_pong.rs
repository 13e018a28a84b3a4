//! Future round-trip latency: spawn a task that computes one value and
//! immediately await it, one pair at a time. Exercises the "ping pong"
//! pattern an eager future's always-allocated channel and a lazy future's
//! inline fast path both claim to handle well, at worker counts from one
//! (no stealing possible) up to the host's CPU count (steals likely).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use forktask::{await_future, spawn_future, Runtime, RuntimeConfig};

fn bench_ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("future_ping_pong");

    for &workers in &[1usize, 2, 4, num_cpus::get()] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            let mut rt = Runtime::init(RuntimeConfig::builder().workers(workers).build().unwrap());
            b.iter(|| {
                let fut = spawn_future(rt.master(), None, || black_box(1u64) + 1);
                black_box(await_future(rt.master(), &fut))
            });
            rt.exit();
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ping_pong);
criterion_main!(benches);
