//! Sequential semantics shared by all four map variants.

mod common;

use cftree::{
    ConcurrentMap, FriendlyAvlMap, FriendlySplayMap, LogicalOrderingMap, OptimisticSplayMap,
};

macro_rules! map_semantics_tests {
    ($name:ident, $map:ty) => {
        mod $name {
            use super::*;

            fn keys_in_order(map: &$map) -> Vec<i64> {
                map.iter().map(|(k, _)| k).collect()
            }

            #[test]
            fn seed_scenario_basic() {
                common::init_tracing();
                let map = <$map>::new();

                for &k in &[5, 3, 8, 1, 4, 7, 9] {
                    assert!(map.put_if_absent(k, k).is_none());
                }

                assert_eq!(map.get(&4).as_deref(), Some(&4));
                assert_eq!(map.remove(&3).as_deref(), Some(&3));
                assert!(map.get(&3).is_none());
                assert_eq!(map.len(), 6);
                assert_eq!(keys_in_order(&map), vec![1, 4, 5, 7, 8, 9]);
            }

            #[test]
            fn seed_scenario_put_if_absent() {
                let map = <$map>::new();

                assert!(map.put_if_absent(10, 100).is_none());
                assert_eq!(map.put_if_absent(10, 200).as_deref(), Some(&100));
                assert_eq!(map.get(&10).as_deref(), Some(&100));
            }

            #[test]
            fn remove_is_idempotent() {
                let map = <$map>::new();

                assert!(map.put_if_absent(42, 1).is_none());
                assert_eq!(map.remove(&42).as_deref(), Some(&1));
                assert!(map.remove(&42).is_none());
                assert!(map.remove(&42).is_none());
            }

            #[test]
            fn get_and_remove_on_empty_map() {
                let map = <$map>::new();

                assert!(map.is_empty());
                assert_eq!(map.len(), 0);
                assert!(map.get(&7).is_none());
                assert!(map.remove(&7).is_none());
                assert_eq!(map.iter().count(), 0);
            }

            #[test]
            fn reinsert_after_remove_uses_new_value() {
                let map = <$map>::new();

                assert!(map.put_if_absent(5, 50).is_none());
                assert_eq!(map.remove(&5).as_deref(), Some(&50));
                assert!(map.put_if_absent(5, 51).is_none());
                assert_eq!(map.get(&5).as_deref(), Some(&51));
            }

            #[test]
            fn negative_and_extreme_keys() {
                let map = <$map>::new();

                for &k in &[0, -1, i64::MIN, i64::MAX, 17] {
                    assert!(map.put_if_absent(k, k).is_none());
                }
                assert_eq!(
                    keys_in_order(&map),
                    vec![i64::MIN, -1, 0, 17, i64::MAX]
                );
                for &k in &[0, -1, i64::MIN, i64::MAX, 17] {
                    assert_eq!(map.get(&k).as_deref(), Some(&k));
                }
            }

            #[test]
            fn len_tracks_live_keys_only() {
                let map = <$map>::new();

                for i in 0..100 {
                    assert!(map.put_if_absent(i, i).is_none());
                }
                for i in (0..100).step_by(3) {
                    assert!(map.remove(&i).is_some());
                }

                let removed = (0..100).step_by(3).count();
                assert_eq!(map.len(), 100 - removed);
                assert_eq!(map.iter().count(), 100 - removed);
            }

            #[test]
            fn clear_then_reuse() {
                let map = <$map>::new();

                for i in 0..50 {
                    map.put_if_absent(i, i);
                }
                map.clear();
                assert!(map.is_empty());

                assert!(map.put_if_absent(3, 33).is_none());
                assert_eq!(map.get(&3).as_deref(), Some(&33));
                assert_eq!(map.len(), 1);
            }
        }
    };
}

map_semantics_tests!(friendly_avl, FriendlyAvlMap<i64, i64>);
map_semantics_tests!(friendly_splay, FriendlySplayMap<i64, i64>);
map_semantics_tests!(optimistic_splay, OptimisticSplayMap<i64, i64>);
map_semantics_tests!(logical_ordering, LogicalOrderingMap<i64, i64>);
