//! Tree-shape properties: order preservation under restructuring,
//! pathological-input flattening, and physical unlink of tombstones.

mod common;

use cftree::{
    ConcurrentMap, FriendlyAvlMap, FriendlySplayMap, LogicalOrderingMap, OptimisticSplayMap,
    TreeConfig,
};

/// Configuration that makes the splay machinery fire on every access.
fn eager_splay() -> TreeConfig {
    TreeConfig {
        thread_num: 1,
        inv_splay_prob: 1,
        k1: 1.0,
        max_depth: 0,
        ..TreeConfig::default()
    }
}

/// Deterministic xorshift for reproducible access patterns.
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

macro_rules! order_preservation_tests {
    ($name:ident, $build:expr) => {
        mod $name {
            use super::*;

            #[test]
            fn order_preserved_under_mixed_churn() {
                common::init_tracing();
                let map = $build;
                let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);

                for _ in 0..20_000 {
                    let key = (rng.next() % 512) as i64;
                    match rng.next() % 3 {
                        0 => {
                            let _ = map.put_if_absent(key, key);
                        }
                        1 => {
                            let _ = map.remove(&key);
                        }
                        _ => {
                            if let Some(v) = map.get(&key) {
                                assert_eq!(*v, key);
                            }
                        }
                    }
                }

                // Strictly ascending scan, no duplicates, no ghosts.
                let keys: Vec<i64> = map.iter().map(|(k, _)| k).collect();
                assert!(keys.windows(2).all(|w| w[0] < w[1]), "scan out of order");
                for k in &keys {
                    assert_eq!(map.get(k).as_deref(), Some(k));
                }
                assert_eq!(map.len(), keys.len());
            }
        }
    };
}

order_preservation_tests!(avl_order, FriendlyAvlMap::<i64, i64>::new());
order_preservation_tests!(splay_order, FriendlySplayMap::<i64, i64>::with_config(eager_splay()));
order_preservation_tests!(
    optimistic_order,
    OptimisticSplayMap::<i64, i64>::with_config(eager_splay())
);
order_preservation_tests!(logical_order, LogicalOrderingMap::<i64, i64>::new());

// ============================================================================
//  Monotone (pathological) insertion flattening
// ============================================================================

#[test]
fn avl_flattens_monotone_inserts() {
    let map: FriendlyAvlMap<i64, i64> = FriendlyAvlMap::new();
    for i in 1..=1000 {
        assert!(map.put_if_absent(i, i).is_none());
    }

    // Maintenance runs on the inserting thread, so the chain is already
    // rebalanced by the time the inserts return.
    assert!(map.height() < 100, "height {}", map.height());

    let mut rng = XorShift(42);
    for _ in 0..1000 {
        let key = (rng.next() % 1000 + 1) as i64;
        assert_eq!(map.get(&key).as_deref(), Some(&key));
    }
    assert!(map.height() < 100, "height {}", map.height());
}

#[test]
fn splay_flattens_monotone_inserts_under_reads() {
    let map: FriendlySplayMap<i64, i64> = FriendlySplayMap::with_config(eager_splay());
    for i in 1..=1000 {
        assert!(map.put_if_absent(i, i).is_none());
    }
    let initial = map.height();
    assert_eq!(initial, 1000);

    let mut rng = XorShift(7);
    for _ in 0..20_000 {
        let key = (rng.next() % 1000 + 1) as i64;
        assert_eq!(map.get(&key).as_deref(), Some(&key));
    }

    assert!(
        map.height() < 100,
        "splay left height at {} after random reads",
        map.height()
    );
}

#[test]
fn optimistic_flattens_monotone_inserts_under_reads() {
    let map: OptimisticSplayMap<i64, i64> = OptimisticSplayMap::with_config(eager_splay());
    for i in 1..=1000 {
        assert!(map.put_if_absent(i, i).is_none());
    }
    let initial = map.height();
    assert_eq!(initial, 1000);

    let mut rng = XorShift(7);
    for _ in 0..20_000 {
        let key = (rng.next() % 1000 + 1) as i64;
        assert_eq!(map.get(&key).as_deref(), Some(&key));
    }

    assert!(
        map.height() < 100,
        "splay left height at {} after random reads",
        map.height()
    );
}

// ============================================================================
//  Insert-then-delete-everything: physical unlink
// ============================================================================

/// Midpoint (BFS) insertion order over `1..=size`, the harness's way of
/// building a balanced starting tree.
fn midpoint_order(size: i64) -> Vec<i64> {
    let mut order = Vec::with_capacity(size as usize);
    let mut queue = std::collections::VecDeque::new();
    queue.push_back((1, size));
    while let Some((lo, hi)) = queue.pop_front() {
        if lo > hi {
            continue;
        }
        let mid = (lo + hi) / 2;
        order.push(mid);
        if lo == hi {
            continue;
        }
        queue.push_back((lo, mid - 1));
        queue.push_back((mid + 1, hi));
    }
    order
}

/// Delete in doubling prefix layers (1, 2, 4, ... keys per layer), then
/// whatever remains.
fn layered_delete<M: ConcurrentMap<i64, i64>>(map: &M, order: &[i64]) {
    let mut i = 0;
    let mut deg = 1;
    let mut last_layer = 0;
    while i + deg < order.len() {
        for &k in &order[i..i + deg] {
            assert_eq!(map.remove(&k).as_deref(), Some(&k));
        }
        i += deg;
        last_layer = i;
        deg <<= 1;
    }
    for &k in &order[last_layer..] {
        assert_eq!(map.remove(&k).as_deref(), Some(&k));
    }
}

#[test]
fn avl_delete_everything_unlinks_every_node() {
    let map: FriendlyAvlMap<i64, i64> = FriendlyAvlMap::new();
    let order = midpoint_order(1023);
    for &k in &order {
        assert!(map.put_if_absent(k, k).is_none());
    }

    layered_delete(&map, &order);

    assert_eq!(map.len(), 0);
    // Remove-triggered maintenance cascades tombstone unlinks, so the
    // tree is structurally empty, not just logically.
    assert!(map.is_empty(), "routing nodes left behind");
    assert_eq!(map.height(), 0);
}

#[test]
fn logical_delete_everything_unlinks_every_node() {
    let map: LogicalOrderingMap<i64, i64> = LogicalOrderingMap::new();
    let order = midpoint_order(1023);
    for &k in &order {
        assert!(map.put_if_absent(k, k).is_none());
    }

    layered_delete(&map, &order);

    assert_eq!(map.len(), 0);
    // Removal is physical in this variant: chain splice plus tree
    // unlink, so nothing survives.
    assert!(map.is_empty());
    assert_eq!(map.height(), 0);
}

#[test]
fn splay_delete_everything_reaches_size_zero() {
    let map: FriendlySplayMap<i64, i64> = FriendlySplayMap::with_config(eager_splay());
    let order = midpoint_order(1023);
    for &k in &order {
        assert!(map.put_if_absent(k, k).is_none());
    }

    layered_delete(&map, &order);

    // Unlink here is opportunistic (piggybacked on splays), so only the
    // logical size is guaranteed.
    assert_eq!(map.len(), 0);
    assert_eq!(map.iter().count(), 0);
}

#[test]
fn optimistic_delete_everything_reaches_size_zero() {
    let map: OptimisticSplayMap<i64, i64> = OptimisticSplayMap::new();
    let order = midpoint_order(1023);
    for &k in &order {
        assert!(map.put_if_absent(k, k).is_none());
    }

    layered_delete(&map, &order);

    assert_eq!(map.len(), 0);
    assert_eq!(map.iter().count(), 0);
}

// ============================================================================
//  Tombstones stay bounded under mixed load
// ============================================================================

#[test]
fn avl_tombstones_bounded_under_mixed_load() {
    let map: FriendlyAvlMap<i64, i64> = FriendlyAvlMap::new();
    let mut rng = XorShift(0xDEAD_BEEF);

    for _ in 0..50_000 {
        let key = (rng.next() % 256) as i64;
        if rng.next() % 2 == 0 {
            let _ = map.put_if_absent(key, key);
        } else {
            let _ = map.remove(&key);
        }
    }

    // At most the keyspace is live; the structure must not hoard an
    // unbounded trail of routing nodes.
    assert!(map.height() <= 64, "height {}", map.height());
}
