//! Property tests: under a single thread, every variant must behave
//! exactly like a reference `BTreeMap` for any operation sequence.

mod common;

use std::collections::BTreeMap;

use proptest::prelude::*;

use cftree::{
    ConcurrentMap, FriendlyAvlMap, FriendlySplayMap, LogicalOrderingMap, OptimisticSplayMap,
};

/// One map operation over a deliberately small key domain, so sequences
/// revisit keys and exercise tombstones and revives.
#[derive(Debug, Clone)]
enum Op {
    Get(i64),
    PutIfAbsent(i64, i64),
    Remove(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = 0_i64..32;
    prop_oneof![
        key.clone().prop_map(Op::Get),
        (key.clone(), any::<i64>()).prop_map(|(k, v)| Op::PutIfAbsent(k, v)),
        key.prop_map(Op::Remove),
    ]
}

fn check_against_reference<M: ConcurrentMap<i64, i64>>(map: &M, ops: &[Op]) {
    let mut reference: BTreeMap<i64, i64> = BTreeMap::new();

    for op in ops {
        match *op {
            Op::Get(k) => {
                assert_eq!(map.get(&k).as_deref(), reference.get(&k), "get({k})");
            }
            Op::PutIfAbsent(k, v) => {
                let expected = reference.get(&k).copied();
                if expected.is_none() {
                    reference.insert(k, v);
                }
                assert_eq!(
                    map.put_if_absent(k, v).as_deref(),
                    expected.as_ref(),
                    "put_if_absent({k})"
                );
            }
            Op::Remove(k) => {
                let expected = reference.remove(&k);
                assert_eq!(map.remove(&k).as_deref(), expected.as_ref(), "remove({k})");
            }
        }
        assert_eq!(map.len(), reference.len());
    }

    assert_eq!(map.is_empty(), reference.is_empty());
}

fn final_scan_matches<I: Iterator<Item = (i64, std::sync::Arc<i64>)>>(
    iter: I,
    ops: &[Op],
) {
    let mut reference: BTreeMap<i64, i64> = BTreeMap::new();
    for op in ops {
        match *op {
            Op::PutIfAbsent(k, v) => {
                reference.entry(k).or_insert(v);
            }
            Op::Remove(k) => {
                reference.remove(&k);
            }
            Op::Get(_) => {}
        }
    }

    let scanned: Vec<(i64, i64)> = iter.map(|(k, v)| (k, *v)).collect();
    let expected: Vec<(i64, i64)> = reference.into_iter().collect();
    assert_eq!(scanned, expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn avl_matches_reference(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let map: FriendlyAvlMap<i64, i64> = FriendlyAvlMap::new();
        check_against_reference(&map, &ops);
        final_scan_matches(map.iter(), &ops);
    }

    #[test]
    fn splay_matches_reference(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let map: FriendlySplayMap<i64, i64> = FriendlySplayMap::new();
        check_against_reference(&map, &ops);
        final_scan_matches(map.iter(), &ops);
    }

    #[test]
    fn optimistic_matches_reference(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let map: OptimisticSplayMap<i64, i64> = OptimisticSplayMap::new();
        check_against_reference(&map, &ops);
        final_scan_matches(map.iter(), &ops);
    }

    #[test]
    fn logical_matches_reference(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let map: LogicalOrderingMap<i64, i64> = LogicalOrderingMap::new();
        check_against_reference(&map, &ops);
        final_scan_matches(map.iter(), &ops);
    }
}
