//! Concurrent stress tests: same-key contention, disjoint-range
//! accounting, and shared-range churn with post-quiescence invariant
//! sweeps.

mod common;

use std::sync::Arc;
use std::thread;

use cftree::{
    ConcurrentMap, FriendlyAvlMap, FriendlySplayMap, LogicalOrderingMap, OptimisticSplayMap,
};

/// Deterministic xorshift; each thread derives its own stream.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

macro_rules! stress_tests {
    ($name:ident, $map:ty) => {
        mod $name {
            use super::*;

            /// One inserter and one remover fighting over a single key.
            /// After quiescence the map must agree with itself.
            #[test]
            fn same_key_insert_remove_contention() {
                common::init_tracing();
                const ROUNDS: usize = 30_000;

                let map: Arc<$map> = Arc::new(<$map>::new());
                let key: i64 = 7;

                let inserter = {
                    let map = Arc::clone(&map);
                    thread::spawn(move || {
                        for i in 0..ROUNDS {
                            let _ = map.put_if_absent(key, i as i64);
                        }
                    })
                };
                let remover = {
                    let map = Arc::clone(&map);
                    thread::spawn(move || {
                        for _ in 0..ROUNDS {
                            let _ = map.remove(&key);
                        }
                    })
                };

                inserter.join().unwrap();
                remover.join().unwrap();

                let len = map.len();
                assert!(len <= 1, "len {len}");
                assert_eq!(map.get(&key).is_some(), len == 1);
            }

            /// Threads own disjoint key ranges; each knows exactly what
            /// it left behind, so the final state is fully checkable.
            #[test]
            fn disjoint_ranges_account_exactly() {
                const THREADS: usize = 8;
                const RANGE: i64 = 1_000;
                const OPS: usize = 20_000;

                let map: Arc<$map> = Arc::new(<$map>::new());

                let handles: Vec<_> = (0..THREADS)
                    .map(|t| {
                        let map = Arc::clone(&map);
                        thread::spawn(move || {
                            let base = t as i64 * RANGE;
                            let mut rng = XorShift::new(0xA5A5_0000 + t as u64);
                            let mut live = vec![false; RANGE as usize];

                            for _ in 0..OPS {
                                let offset = (rng.next() % RANGE as u64) as i64;
                                let key = base + offset;
                                match rng.next() % 4 {
                                    0 | 1 => {
                                        let was_absent =
                                            map.put_if_absent(key, key).is_none();
                                        assert_eq!(was_absent, !live[offset as usize]);
                                        live[offset as usize] = true;
                                    }
                                    2 => {
                                        let removed = map.remove(&key).is_some();
                                        assert_eq!(removed, live[offset as usize]);
                                        live[offset as usize] = false;
                                    }
                                    _ => {
                                        assert_eq!(
                                            map.get(&key).is_some(),
                                            live[offset as usize]
                                        );
                                    }
                                }
                            }
                            live.iter().filter(|&&l| l).count()
                        })
                    })
                    .collect();

                let expected: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
                assert_eq!(map.len(), expected);
                assert_eq!(map.iter().count(), expected);
            }

            /// All threads churn one small shared keyspace. Afterwards:
            /// ordered scan, no duplicates, no ghosts.
            #[test]
            fn shared_range_churn_keeps_invariants() {
                const THREADS: usize = 8;
                const KEYSPACE: u64 = 128;
                const OPS: usize = 30_000;

                let map: Arc<$map> = Arc::new(<$map>::new());

                let handles: Vec<_> = (0..THREADS)
                    .map(|t| {
                        let map = Arc::clone(&map);
                        thread::spawn(move || {
                            let mut rng = XorShift::new(0x5EED + t as u64);
                            for _ in 0..OPS {
                                let key = (rng.next() % KEYSPACE) as i64;
                                match rng.next() % 4 {
                                    0 | 1 => {
                                        let _ = map.get(&key);
                                    }
                                    2 => {
                                        let _ = map.put_if_absent(key, key);
                                    }
                                    _ => {
                                        let _ = map.remove(&key);
                                    }
                                }
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }

                let keys: Vec<i64> = map.iter().map(|(k, _)| k).collect();
                assert!(keys.windows(2).all(|w| w[0] < w[1]), "scan out of order");
                for k in &keys {
                    assert_eq!(map.get(k).as_deref(), Some(k), "ghost key {k}");
                }
                assert_eq!(map.len(), keys.len());
            }

            /// Readers iterate while writers churn; the cursor must make
            /// progress and yield an ordered sequence every pass.
            #[test]
            fn iteration_during_churn_stays_ordered() {
                const WRITERS: usize = 4;
                const OPS: usize = 10_000;

                let map: Arc<$map> = Arc::new(<$map>::new());
                for i in 0..256 {
                    map.put_if_absent(i, i);
                }

                let writers: Vec<_> = (0..WRITERS)
                    .map(|t| {
                        let map = Arc::clone(&map);
                        thread::spawn(move || {
                            let mut rng = XorShift::new(0xC0FFEE + t as u64);
                            for _ in 0..OPS {
                                let key = (rng.next() % 256) as i64;
                                if rng.next() % 2 == 0 {
                                    let _ = map.put_if_absent(key, key);
                                } else {
                                    let _ = map.remove(&key);
                                }
                            }
                        })
                    })
                    .collect();

                for _ in 0..50 {
                    let keys: Vec<i64> = map.iter().map(|(k, _)| k).collect();
                    assert!(
                        keys.windows(2).all(|w| w[0] < w[1]),
                        "concurrent scan out of order"
                    );
                }

                for h in writers {
                    h.join().unwrap();
                }
            }
        }
    };
}

stress_tests!(friendly_avl, FriendlyAvlMap<i64, i64>);
stress_tests!(friendly_splay, FriendlySplayMap<i64, i64>);
stress_tests!(optimistic_splay, OptimisticSplayMap<i64, i64>);
stress_tests!(logical_ordering, LogicalOrderingMap<i64, i64>);

/// Mixed-variant smoke test with the default (production) splay
/// configuration, so the probabilistic gates run with their real
/// parameters under contention.
#[test]
fn default_config_mixed_workload_smoke() {
    const THREADS: usize = 8;
    const OPS: usize = 20_000;

    fn churn<M: ConcurrentMap<i64, i64> + Send + Sync + 'static>(map: M) -> Arc<M> {
        let map = Arc::new(map);
        for i in 0..10_000 {
            map.put_if_absent(i, i);
        }

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let mut rng = XorShift::new(0xFACE + t as u64);
                    for _ in 0..OPS {
                        let key = (rng.next() % 10_000) as i64;
                        match rng.next() % 4 {
                            0 | 1 => {
                                let _ = map.get(&key);
                            }
                            2 => {
                                let _ = map.put_if_absent(key, key);
                            }
                            _ => {
                                let _ = map.remove(&key);
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        map
    }

    fn assert_sorted(keys: &[i64]) {
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    let avl = churn(FriendlyAvlMap::<i64, i64>::new());
    assert_sorted(&avl.iter().map(|(k, _)| k).collect::<Vec<_>>());

    let splay = churn(FriendlySplayMap::<i64, i64>::new());
    assert_sorted(&splay.iter().map(|(k, _)| k).collect::<Vec<_>>());

    let optimistic = churn(OptimisticSplayMap::<i64, i64>::new());
    assert_sorted(&optimistic.iter().map(|(k, _)| k).collect::<Vec<_>>());

    let logical = churn(LogicalOrderingMap::<i64, i64>::new());
    assert_sorted(&logical.iter().map(|(k, _)| k).collect::<Vec<_>>());
}
