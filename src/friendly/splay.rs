//! Contention-friendly splay map.
//!
//! Same node model and mutation contract as the AVL variant, but no
//! balance bookkeeping. Instead, a successful access may splay the
//! touched node toward the root. Two throttles keep splaying from
//! becoming the contention it is meant to relieve:
//!
//! - a probability gate (one access in `inv_splay_prob * thread_num`
//!   enters at all), and
//! - a hotness gate comparing the node's access count against the
//!   thread's total: `m = floor(ln(total / node))`; splaying starts only
//!   when `depth > k1 * m` and continues only while `depth > k2 * m`.
//!
//! The climb takes ancestor locks with bounded try-locks and gives up
//! once the conflict budget is spent; a partial splay is benign. Each
//! step first tries to unlink any tombstone among the locked ancestors,
//! piggybacking physical deletion on hot paths.

use std::sync::Arc;

use rand::Rng;
use seize::{Guard, LocalGuard};

use crate::config::TreeConfig;
use crate::map::ConcurrentMap;
use crate::ordering::STAT_ORD;
use crate::stats::StatsSnapshot;
use crate::tracing_helpers::trace_log;

use super::node::{Node, locked_value_ptr};
use super::{FriendlyIter, PutOutcome, TreeCore, reclaim_node};

/// A concurrent ordered map backed by a contention-friendly binary
/// search tree with probabilistic splaying.
pub struct FriendlySplayMap<K, V> {
    core: TreeCore<K, V>,
}

// SAFETY: All shared state is guarded by per-node locks, atomics, and
// the seize grace period; raw pointers never escape the protocol.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for FriendlySplayMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for FriendlySplayMap<K, V> {}

impl<K, V> FriendlySplayMap<K, V> {
    /// Create an empty map with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default())
    }

    /// Create an empty map with an explicit configuration.
    #[must_use]
    pub fn with_config(config: TreeConfig) -> Self {
        Self {
            core: TreeCore::with_config(config),
        }
    }

    /// Aggregate operation statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats().snapshot()
    }

    /// Longest root-to-leaf path, counting tombstone routing nodes.
    /// Meant for quiescent shape inspection.
    #[must_use]
    pub fn height(&self) -> usize {
        self.core.depth_impl()
    }

    /// Probability of starting (iteration 0) or continuing a splay.
    fn rotate_prob(&self, iterations: u64) -> f64 {
        if iterations == 0 {
            self.core.config().splay_prob()
        } else {
            0.0
        }
    }
}

impl<K, V> Default for FriendlySplayMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V> FriendlySplayMap<K, V> {
    /// Weakly-consistent cursor over the live mappings in key order.
    pub fn iter(&self) -> FriendlyIter<'_, K, V> {
        FriendlyIter::new(&self.core)
    }

    // ========================================================================
    //  Splay machine
    // ========================================================================

    /// Probabilistically move `node` toward the root after an access at
    /// `depth`. Never blocks beyond the first two locks; gives up early
    /// on try-lock exhaustion.
    fn splay(&self, node: *mut Node<K, V>, depth: u64, guard: &LocalGuard<'_>) {
        let config = self.core.config();

        if rand::thread_rng().gen::<f64>() >= self.rotate_prob(0) {
            return;
        }

        let total = self.core.stats().bump_splay_ops() * u64::from(config.thread_num);
        // SAFETY: node was found by this operation's descent under guard.
        let node_count = unsafe { &*node }.bump_counter();

        #[expect(clippy::cast_precision_loss, reason = "heuristic gate only")]
        let m = ((total as f64) / (node_count as f64)).ln().floor();

        #[expect(clippy::cast_precision_loss, reason = "heuristic gate only")]
        if (depth as f64) <= config.k1 * m || depth < config.max_depth {
            return;
        }

        // SAFETY: As above.
        let n = unsafe { &*node };
        n.lock();
        if n.is_removed() || node == self.core.holder() {
            // SAFETY: Locked just above.
            unsafe { n.unlock() };
            return;
        }

        let mut conflicts: u64 = 0;
        let Some(mut parent) = self.core.try_lock_parent(node, &mut conflicts) else {
            // SAFETY: Locked above.
            unsafe { n.unlock() };
            return;
        };

        if self.splay_try_remove(node, guard) {
            // SAFETY: Both locked above.
            unsafe {
                n.unlock();
                (*parent).unlock();
            }
            return;
        }

        let mut depth = depth;
        #[expect(clippy::cast_precision_loss, reason = "heuristic gate only")]
        while parent != self.core.holder()
            && (depth as f64) > config.k2 * m
            && depth > config.max_depth + 1
        {
            let Some(gparent) = self.core.try_lock_parent(parent, &mut conflicts) else {
                break;
            };

            if self.splay_try_remove(parent, guard) {
                // SAFETY: Locked by try_lock_parent above.
                unsafe { (*gparent).unlock() };
                break;
            }

            if gparent == self.core.holder() {
                // zig
                self.splay_rotate(node, guard);
                // SAFETY: parent locked earlier in this walk.
                unsafe { (*parent).unlock() };
                parent = gparent;
                break;
            }

            let Some(ggparent) = self.core.try_lock_parent(gparent, &mut conflicts) else {
                // SAFETY: Locked by try_lock_parent above.
                unsafe { (*gparent).unlock() };
                break;
            };

            if self.splay_try_remove(gparent, guard) {
                // SAFETY: Both locked above.
                unsafe {
                    (*gparent).unlock();
                    (*ggparent).unlock();
                }
                break;
            }

            // SAFETY: parent and gparent locked earlier in this walk.
            let p = unsafe { &*parent };
            let g = unsafe { &*gparent };

            if (p.left() == node) == (g.left() == parent) {
                // zig-zig: raise the parent first, then the node.
                self.splay_rotate(parent, guard);
                self.splay_rotate(node, guard);
            } else {
                // zig-zag: two rotations at the node.
                self.splay_rotate(node, guard);
                self.splay_rotate(node, guard);
            }

            // SAFETY: Locked earlier in this walk.
            unsafe {
                p.unlock();
                g.unlock();
            }
            parent = ggparent;
            depth = depth.saturating_sub(2);
        }

        // SAFETY: node locked at entry; parent is the last ancestor
        // still locked.
        unsafe {
            n.unlock();
            (*parent).unlock();
        }
    }

    /// Opportunistically unlink `target` if it is an unlinkable
    /// tombstone. Caller holds `target`'s lock and its parent's lock.
    fn splay_try_remove(&self, target: *mut Node<K, V>, guard: &LocalGuard<'_>) -> bool {
        // SAFETY: Locked by the caller.
        let node = unsafe { &*target };
        if !node.is_removed()
            && node.value_ptr().is_null()
            && (node.left().is_null() || node.right().is_null())
        {
            return self.splay_remove_node(target, guard);
        }
        false
    }

    /// Splice a tombstone out. Both the node and its parent are locked.
    /// The unlinked node's child links are redirected to its former
    /// parent so readers paused on it keep making downward progress.
    fn splay_remove_node(&self, target: *mut Node<K, V>, guard: &LocalGuard<'_>) -> bool {
        // SAFETY: Locked by the caller.
        let node = unsafe { &*target };
        if !node.value_ptr().is_null() {
            return false;
        }

        let parent = node.parent();
        let left = node.left();
        let child = if left.is_null() {
            node.right()
        } else {
            if !node.right().is_null() {
                return false;
            }
            left
        };

        // SAFETY: The parent is locked by the caller.
        let p = unsafe { &*parent };
        if p.left() == target {
            p.set_left(child);
        } else {
            p.set_right(child);
        }
        if !child.is_null() {
            // SAFETY: child's old and new parents are locked.
            unsafe { &*child }.set_parent(parent);
        }

        node.set_left(parent);
        node.set_right(parent);
        node.mark_removed();

        let local = self.core.stats().local();
        local.real_nodes_deleted.fetch_add(1, STAT_ORD);
        local.struct_mods.fetch_add(1, STAT_ORD);
        trace_log!("splay path unlinked a tombstone");

        // SAFETY: Unreachable by new traversals; grace period covers the
        // rest.
        unsafe { guard.defer_retire(target, reclaim_node::<K, V>) };
        true
    }

    /// One rotation raising `node` one level. The node, its parent, and
    /// its grandparent are locked.
    fn splay_rotate(&self, node: *mut Node<K, V>, guard: &LocalGuard<'_>) {
        // SAFETY: Locked by the caller.
        let n = unsafe { &*node };
        let parent = n.parent();
        // SAFETY: Locked by the caller.
        let p = unsafe { &*parent };

        if p.left() == node {
            self.splay_right_rotate(parent, p.parent(), guard);
        } else {
            self.splay_left_rotate(parent, p.parent(), guard);
        }
    }

    /// Rotate the locked pivot `target` right under `parent`, splicing
    /// in a fresh replacement for the pivot.
    fn splay_right_rotate(
        &self,
        target: *mut Node<K, V>,
        parent: *mut Node<K, V>,
        guard: &LocalGuard<'_>,
    ) {
        // SAFETY: target, its left child, and parent are locked by the
        // splay walk.
        let node = unsafe { &*target };
        let nl = node.left();
        let left = unsafe { &*nl };
        let nlr = left.right();
        let nr = node.right();

        let fresh = Box::into_raw(Box::new(Node::rotated(
            node.clone_key(),
            0,
            locked_value_ptr(node),
            nlr,
            nr,
            nl,
        )));
        if !nr.is_null() {
            // SAFETY: nr's parent (target) is locked.
            unsafe { &*nr }.set_parent(fresh);
        }
        if !nlr.is_null() {
            // SAFETY: nlr's old parent (left) is locked.
            unsafe { &*nlr }.set_parent(fresh);
        }

        left.set_right(fresh);
        // SAFETY: parent is locked by the splay walk.
        let p = unsafe { &*parent };
        if p.left() == target {
            p.set_left(nl);
        } else {
            p.set_right(nl);
        }
        left.set_parent(parent);

        node.mark_removed();
        self.core.stats().local().struct_mods.fetch_add(1, STAT_ORD);

        // SAFETY: The pivot is unreachable by new traversals.
        unsafe { guard.defer_retire(target, reclaim_node::<K, V>) };
    }

    /// Mirror image of [`Self::splay_right_rotate`].
    fn splay_left_rotate(
        &self,
        target: *mut Node<K, V>,
        parent: *mut Node<K, V>,
        guard: &LocalGuard<'_>,
    ) {
        // SAFETY: target, its right child, and parent are locked by the
        // splay walk.
        let node = unsafe { &*target };
        let nr = node.right();
        let right = unsafe { &*nr };
        let nrl = right.left();
        let nl = node.left();

        let fresh = Box::into_raw(Box::new(Node::rotated(
            node.clone_key(),
            0,
            locked_value_ptr(node),
            nl,
            nrl,
            nr,
        )));
        if !nl.is_null() {
            // SAFETY: nl's parent (target) is locked.
            unsafe { &*nl }.set_parent(fresh);
        }
        if !nrl.is_null() {
            // SAFETY: nrl's old parent (right) is locked.
            unsafe { &*nrl }.set_parent(fresh);
        }

        right.set_left(fresh);
        // SAFETY: parent is locked by the splay walk.
        let p = unsafe { &*parent };
        if p.left() == target {
            p.set_left(nr);
        } else {
            p.set_right(nr);
        }
        right.set_parent(parent);

        node.mark_removed();
        self.core.stats().local().struct_mods.fetch_add(1, STAT_ORD);

        // SAFETY: The pivot is unreachable by new traversals.
        unsafe { guard.defer_retire(target, reclaim_node::<K, V>) };
    }
}

impl<K: Ord + Clone, V> ConcurrentMap<K, V> for FriendlySplayMap<K, V> {
    fn get(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.core.guard();
        let (value, found) = self.core.get_impl(key, &guard);
        if value.is_some() {
            if let Some(found) = found {
                self.splay(found.node, found.depth, &guard);
            }
        }
        value
    }

    fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let guard = self.core.guard();
        match self.core.put_if_absent_impl(key, value, &guard) {
            PutOutcome::Existing(previous) => Some(previous),
            PutOutcome::Inserted { .. } | PutOutcome::Revived => None,
        }
    }

    fn remove(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.core.guard();
        self.core.remove_impl(key, &guard).map(|(previous, _)| previous)
    }

    fn len(&self) -> usize {
        self.core.len_impl()
    }

    fn is_empty(&self) -> bool {
        self.core.is_empty_impl()
    }

    fn clear(&self) {
        self.core.clear_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Config that makes the splay machinery fire on every access.
    fn eager_config() -> TreeConfig {
        TreeConfig {
            thread_num: 1,
            inv_splay_prob: 1,
            max_depth: 0,
            ..TreeConfig::default()
        }
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let map: FriendlySplayMap<i64, u64> = FriendlySplayMap::new();

        assert!(map.put_if_absent(1, 10).is_none());
        assert_eq!(map.get(&1).as_deref(), Some(&10));
        assert_eq!(map.remove(&1).as_deref(), Some(&10));
        assert!(map.get(&1).is_none());
    }

    #[test]
    fn splaying_preserves_order() {
        let map: FriendlySplayMap<i64, i64> = FriendlySplayMap::with_config(eager_config());
        for i in 0..512 {
            assert!(map.put_if_absent(i, i).is_none());
        }
        // Hammer one deep key so the gate triggers.
        for _ in 0..2048 {
            assert_eq!(map.get(&511).as_deref(), Some(&511));
        }

        let keys: Vec<i64> = map.iter().map(|(k, _)| k).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 512);
    }

    #[test]
    fn hot_key_moves_up() {
        let map: FriendlySplayMap<i64, i64> = FriendlySplayMap::with_config(eager_config());
        for i in 0..1000 {
            map.put_if_absent(i, i);
        }
        let before = map.height();

        for _ in 0..4000 {
            map.get(&999);
        }
        // The monotone chain puts 999 at the bottom; repeated access
        // must shorten the tree.
        assert!(map.height() < before, "{} !< {}", map.height(), before);
    }

    #[test]
    fn tombstones_reclaimed_on_hot_paths() {
        let map: FriendlySplayMap<i64, i64> = FriendlySplayMap::with_config(eager_config());
        for i in 0..256 {
            map.put_if_absent(i, i);
        }
        for i in 0..128 {
            assert!(map.remove(&i).is_some());
        }
        // The tombstones sit on the paths to the live keys; hot reads
        // climb through them and unlink what they can.
        for round in 0..64 {
            for key in 128..256 {
                assert_eq!(map.get(&key).as_deref(), Some(&key), "round {round}");
            }
        }

        assert_eq!(map.len(), 128);
        let snapshot = map.stats();
        assert!(snapshot.real_nodes_deleted > 0, "no opportunistic unlinks");
    }
}
