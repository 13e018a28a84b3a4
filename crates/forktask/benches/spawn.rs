//! Spawn throughput: how many empty fork/join tasks a pool can push and
//! drain per second, at a few worker counts.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use forktask::{sync, JoinCounter, Runtime, RuntimeConfig};

const TASKS_PER_ITER: u64 = 10_000;

fn bench_spawn_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_empty_tasks");
    group.throughput(Throughput::Elements(TASKS_PER_ITER));

    for &workers in &[1usize, 2, 4, num_cpus::get()] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            let mut rt = Runtime::init(RuntimeConfig::builder().workers(workers).build().unwrap());
            b.iter(|| {
                let counter = JoinCounter::new();
                for _ in 0..TASKS_PER_ITER {
                    // SAFETY: `sync` below runs before `counter` drops.
                    unsafe {
                        spawn_noop(&mut rt, &counter);
                    }
                }
                sync(rt.master(), &counter);
                black_box(());
            });
            rt.exit();
        });
    }
    group.finish();
}

unsafe fn spawn_noop(rt: &mut Runtime, counter: &JoinCounter) {
    let parent = rt.master().current_task();
    unsafe {
        forktask::spawn_async(rt.master(), parent, counter, || {});
    }
}

criterion_group!(benches, bench_spawn_throughput);
criterion_main!(benches);
