//! Criterion benchmarks comparing the four tree variants on read-heavy
//! and mixed workloads.

use std::sync::Arc;
use std::thread;

use criterion::{Criterion, criterion_group, criterion_main};

use cftree::{
    ConcurrentMap, FriendlyAvlMap, FriendlySplayMap, LogicalOrderingMap, OptimisticSplayMap,
};

const PREFILL: i64 = 10_000;
const OPS_PER_THREAD: usize = 10_000;
const THREADS: usize = 4;

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn prefill<M: ConcurrentMap<i64, i64>>(map: &M) {
    for i in 0..PREFILL {
        map.put_if_absent(i, i);
    }
}

/// 100% get.
fn read_heavy<M: ConcurrentMap<i64, i64> + Send + Sync + 'static>(map: Arc<M>) {
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut rng = XorShift(0x1234_5678 + t as u64);
                for _ in 0..OPS_PER_THREAD {
                    let key = (rng.next() % PREFILL as u64) as i64;
                    std::hint::black_box(map.get(&key));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// 50% get, 25% put-if-absent, 25% remove.
fn mixed<M: ConcurrentMap<i64, i64> + Send + Sync + 'static>(map: Arc<M>) {
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut rng = XorShift(0x8765_4321 + t as u64);
                for _ in 0..OPS_PER_THREAD {
                    let key = (rng.next() % PREFILL as u64) as i64;
                    match rng.next() % 4 {
                        0 | 1 => {
                            std::hint::black_box(map.get(&key));
                        }
                        2 => {
                            std::hint::black_box(map.put_if_absent(key, key));
                        }
                        _ => {
                            std::hint::black_box(map.remove(&key));
                        }
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

fn bench_maps(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_heavy");
    group.sample_size(10);
    group.bench_function("friendly_avl", |b| {
        b.iter_batched(
            || {
                let map = Arc::new(FriendlyAvlMap::<i64, i64>::new());
                prefill(&*map);
                map
            },
            read_heavy,
            criterion::BatchSize::LargeInput,
        );
    });
    group.bench_function("friendly_splay", |b| {
        b.iter_batched(
            || {
                let map = Arc::new(FriendlySplayMap::<i64, i64>::new());
                prefill(&*map);
                map
            },
            read_heavy,
            criterion::BatchSize::LargeInput,
        );
    });
    group.bench_function("optimistic_splay", |b| {
        b.iter_batched(
            || {
                let map = Arc::new(OptimisticSplayMap::<i64, i64>::new());
                prefill(&*map);
                map
            },
            read_heavy,
            criterion::BatchSize::LargeInput,
        );
    });
    group.bench_function("logical_ordering", |b| {
        b.iter_batched(
            || {
                let map = Arc::new(LogicalOrderingMap::<i64, i64>::new());
                prefill(&*map);
                map
            },
            read_heavy,
            criterion::BatchSize::LargeInput,
        );
    });
    group.finish();

    let mut group = c.benchmark_group("mixed_50_25_25");
    group.sample_size(10);
    group.bench_function("friendly_avl", |b| {
        b.iter_batched(
            || {
                let map = Arc::new(FriendlyAvlMap::<i64, i64>::new());
                prefill(&*map);
                map
            },
            mixed,
            criterion::BatchSize::LargeInput,
        );
    });
    group.bench_function("friendly_splay", |b| {
        b.iter_batched(
            || {
                let map = Arc::new(FriendlySplayMap::<i64, i64>::new());
                prefill(&*map);
                map
            },
            mixed,
            criterion::BatchSize::LargeInput,
        );
    });
    group.bench_function("optimistic_splay", |b| {
        b.iter_batched(
            || {
                let map = Arc::new(OptimisticSplayMap::<i64, i64>::new());
                prefill(&*map);
                map
            },
            mixed,
            criterion::BatchSize::LargeInput,
        );
    });
    group.bench_function("logical_ordering", |b| {
        b.iter_batched(
            || {
                let map = Arc::new(LogicalOrderingMap::<i64, i64>::new());
                prefill(&*map);
                map
            },
            mixed,
            criterion::BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_maps);
criterion_main!(benches);
