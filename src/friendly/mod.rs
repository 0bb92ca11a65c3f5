//! Contention-friendly binary search trees.
//!
//! Two map variants share the node model and engine in this module:
//!
//! - [`FriendlyAvlMap`]: relaxed-balance AVL maintenance, deferred and
//!   piggybacked on mutating threads.
//! - [`FriendlySplayMap`]: no balance bookkeeping; accessed nodes are
//!   probabilistically splayed toward the root.
//!
//! Shared design: readers descend without locks; writers lock only the
//! candidate node (and its parent for an insert) after validating that
//! the descent decision still holds under the lock. `remove` only marks
//! a tombstone (null value slot); physical unlink is maintenance work.
//! Rotations never mutate the pivot in place - they splice in a freshly
//! allocated replacement and mark the pivot `removed`, so a reader still
//! descending through the pivot sees the pre-rotation subtree.
//!
//! Unlinked and rotated-out nodes are retired through the map's seize
//! collector and freed once every guard active at retirement has exited.

mod avl;
mod node;
mod splay;

pub use avl::FriendlyAvlMap;
pub use splay::FriendlySplayMap;

use std::ptr as StdPtr;
use std::sync::Arc;

use seize::{Collector, Guard, LocalGuard};

use crate::config::TreeConfig;
use crate::ordering::STAT_ORD;
use crate::stats::Stats;
use crate::tracing_helpers::trace_log;
use crate::value::{reclaim_value, value_clone_raw, value_from_raw, value_into_raw};

use node::{Node, locked_value_ptr};

// ============================================================================
//  Reclaimers
// ============================================================================

/// Free one retired node box. Children and the value slot are never
/// owned by a retired node, so only the box is released.
pub(crate) unsafe fn reclaim_node<K, V>(ptr: *mut Node<K, V>, _collector: &Collector) {
    // SAFETY: ptr came from Box::into_raw and seize ran the grace period.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Free a detached live subtree: every reachable node box plus the value
/// reference of every live slot.
pub(crate) unsafe fn reclaim_subtree<K, V>(root: *mut Node<K, V>, _collector: &Collector) {
    let mut stack: Vec<*mut Node<K, V>> = Vec::with_capacity(64);
    stack.push(root);

    while let Some(ptr) = stack.pop() {
        if ptr.is_null() {
            continue;
        }

        // SAFETY: The subtree was detached before retirement; its nodes
        // are live (never individually retired) and form a tree.
        let node = unsafe { &*ptr };
        stack.push(node.left());
        stack.push(node.right());

        let value = node.value_ptr();
        if !value.is_null() {
            // SAFETY: A live node owns its slot's strong reference.
            drop(unsafe { value_from_raw(value) });
        }

        // SAFETY: ptr came from Box::into_raw; nothing reaches it anymore.
        unsafe { drop(Box::from_raw(ptr)) };
    }
}

// ============================================================================
//  Shared engine
// ============================================================================

/// Location of a key found by a descent.
pub(crate) struct FoundAt<K, V> {
    pub node: *mut Node<K, V>,
    pub depth: u64,
}

/// Outcome of the shared put-if-absent engine.
pub(crate) enum PutOutcome<K, V> {
    /// A live mapping existed; the map is unchanged.
    Existing(Arc<V>),
    /// A fresh leaf was linked under `parent`.
    Inserted { parent: *mut Node<K, V> },
    /// A tombstone node for the key was revived in place.
    Revived,
}

/// State shared by both contention-friendly variants: root holder,
/// collector, configuration, and statistics.
pub(crate) struct TreeCore<K, V> {
    holder: *mut Node<K, V>,
    collector: Collector,
    config: TreeConfig,
    stats: Stats,
}

impl<K, V> TreeCore<K, V> {
    pub(crate) fn with_config(config: TreeConfig) -> Self {
        Self {
            holder: Box::into_raw(Box::new(Node::holder())),
            collector: Collector::new(),
            config,
            stats: Stats::new(),
        }
    }

    #[inline]
    pub(crate) fn holder(&self) -> *mut Node<K, V> {
        self.holder
    }

    #[inline]
    pub(crate) fn config(&self) -> &TreeConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    #[inline]
    pub(crate) fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    fn finish_get(&self, traversed: u64) {
        let local = self.stats.local();
        local.get_count.fetch_add(1, STAT_ORD);
        local.nodes_traversed.fetch_add(traversed, STAT_ORD);
    }

    // ========================================================================
    //  Whole-tree operations
    // ========================================================================

    /// Count live keys. Weakly consistent.
    pub(crate) fn len_impl(&self) -> usize {
        let _guard = self.guard();
        let mut count = 0_usize;
        let mut stack: Vec<*mut Node<K, V>> = Vec::with_capacity(64);
        // SAFETY: holder is valid for the map's lifetime.
        stack.push(unsafe { &*self.holder }.left());

        while let Some(ptr) = stack.pop() {
            if ptr.is_null() {
                continue;
            }
            // SAFETY: Reachable node under the guard above.
            let node = unsafe { &*ptr };
            if !node.value_ptr().is_null() {
                count += 1;
            }
            stack.push(node.left());
            stack.push(node.right());
        }
        count
    }

    /// Longest root-to-leaf path. Weakly consistent; meant for
    /// quiescent shape inspection.
    pub(crate) fn depth_impl(&self) -> usize {
        let _guard = self.guard();
        let mut max_depth = 0_usize;
        let mut stack: Vec<(*mut Node<K, V>, usize)> = Vec::with_capacity(64);
        // SAFETY: holder is valid for the map's lifetime.
        stack.push((unsafe { &*self.holder }.left(), 0));

        while let Some((ptr, depth)) = stack.pop() {
            if ptr.is_null() {
                continue;
            }
            // SAFETY: Reachable node under the guard above.
            let node = unsafe { &*ptr };
            max_depth = max_depth.max(depth + 1);
            stack.push((node.left(), depth + 1));
            stack.push((node.right(), depth + 1));
        }
        max_depth
    }

    pub(crate) fn is_empty_impl(&self) -> bool {
        let _guard = self.guard();
        // SAFETY: holder is valid for the map's lifetime.
        let holder = unsafe { &*self.holder };
        holder.left().is_null() && holder.right().is_null()
    }

    /// Detach the whole tree and retire it. Must not race with writers.
    pub(crate) fn clear_impl(&self) {
        let guard = self.guard();
        // SAFETY: holder is valid for the map's lifetime.
        let holder = unsafe { &*self.holder };

        holder.lock();
        let old = holder.left();
        holder.set_left(StdPtr::null_mut());
        // SAFETY: Locked just above.
        unsafe { holder.unlock() };

        if !old.is_null() {
            // SAFETY: The subtree is detached; readers that entered before
            // the swap are covered by the grace period.
            unsafe { guard.defer_retire(old, reclaim_subtree::<K, V>) };
        }
    }
}

impl<K: Ord, V> TreeCore<K, V> {
    /// Lock-free descent. Returns the value (if a live mapping exists)
    /// together with the matched node and its depth so the splay variant
    /// can adjust afterwards.
    pub(crate) fn get_impl(
        &self,
        key: &K,
        _guard: &LocalGuard<'_>,
    ) -> (Option<Arc<V>>, Option<FoundAt<K, V>>) {
        let mut traversed: u64 = 0;
        let mut depth: u64 = 0;
        let mut next: *mut Node<K, V> = self.holder;

        loop {
            let current = next;
            // SAFETY: current came from a reachable child slot (or is the
            // holder) and the caller holds a guard, so it is not freed.
            let cur = unsafe { &*current };

            match cur.cmp_key(key) {
                std::cmp::Ordering::Equal => {
                    let value = cur.value_ptr();
                    self.finish_get(traversed);

                    if value.is_null() {
                        return (None, None);
                    }
                    // SAFETY: value was loaded from a reachable slot
                    // under the caller's guard.
                    let value = unsafe { value_clone_raw(value) };
                    return (Some(value), Some(FoundAt { node: current, depth }));
                }

                std::cmp::Ordering::Less => next = cur.left(),

                std::cmp::Ordering::Greater => next = cur.right(),
            }

            depth += 1;
            traversed += 1;

            if next.is_null() {
                self.finish_get(traversed);
                return (None, None);
            }
        }
    }

    /// Shared put-if-absent engine.
    ///
    /// The leaf is allocated before any lock is taken so the critical
    /// section is a validate-and-link. Observing a `removed` node during
    /// the locked validation restarts the descent from the root.
    pub(crate) fn put_if_absent_impl(
        &self,
        key: K,
        value: V,
        _guard: &LocalGuard<'_>,
    ) -> PutOutcome<K, V> {
        let spare: Box<Node<K, V>> = Box::new(Node::leaf(key, value_into_raw(Arc::new(value))));

        'restart: loop {
            let mut next: *mut Node<K, V> = self.holder;

            loop {
                let current = next;
                // SAFETY: Reachable node under the caller's guard.
                let cur = unsafe { &*current };
                let cmp = cur.cmp_key(spare.user_key());

                if cmp == std::cmp::Ordering::Equal {
                    let value = cur.value_ptr();
                    if !value.is_null() {
                        // SAFETY: Loaded from a reachable slot under guard.
                        let existing = unsafe { value_clone_raw(value) };
                        discard_spare(spare);
                        return PutOutcome::Existing(existing);
                    }

                    cur.lock();
                    if cur.is_removed() {
                        // SAFETY: Locked just above.
                        unsafe { cur.unlock() };
                        continue 'restart;
                    }

                    let value = locked_value_ptr(cur);
                    if value.is_null() {
                        // Revive the tombstone in place.
                        let fresh = spare.swap_value(StdPtr::null_mut());
                        cur.set_value(fresh);
                        // SAFETY: Locked above.
                        unsafe { cur.unlock() };
                        drop(spare);
                        return PutOutcome::Revived;
                    }

                    // Lost a race with a concurrent revive.
                    // SAFETY: Loaded under the node lock.
                    let existing = unsafe { value_clone_raw(value) };
                    // SAFETY: Locked above.
                    unsafe { cur.unlock() };
                    discard_spare(spare);
                    return PutOutcome::Existing(existing);
                }

                next = if cmp == std::cmp::Ordering::Less {
                    cur.left()
                } else {
                    cur.right()
                };

                if next.is_null() {
                    cur.lock();
                    if cur.is_removed() {
                        // SAFETY: Locked just above.
                        unsafe { cur.unlock() };
                        trace_log!("insert restart: parent removed");
                        continue 'restart;
                    }

                    let reread = if cmp == std::cmp::Ordering::Less {
                        cur.left()
                    } else {
                        cur.right()
                    };

                    if reread.is_null() {
                        spare.set_parent(current);
                        let fresh = Box::into_raw(spare);
                        if cmp == std::cmp::Ordering::Less {
                            cur.set_left(fresh);
                        } else {
                            cur.set_right(fresh);
                        }
                        // SAFETY: Locked above.
                        unsafe { cur.unlock() };
                        return PutOutcome::Inserted { parent: current };
                    }

                    // A concurrent insert claimed the slot; keep descending.
                    // SAFETY: Locked above.
                    unsafe { cur.unlock() };
                    next = reread;
                }
            }
        }
    }

    /// Shared remove engine: tombstone the matched node and retire the
    /// value reference. Returns the previous value and the node so the
    /// AVL variant can schedule maintenance.
    pub(crate) fn remove_impl(
        &self,
        key: &K,
        guard: &LocalGuard<'_>,
    ) -> Option<(Arc<V>, *mut Node<K, V>)> {
        'restart: loop {
            let mut next: *mut Node<K, V> = self.holder;

            loop {
                let current = next;
                // SAFETY: Reachable node under the caller's guard.
                let cur = unsafe { &*current };

                match cur.cmp_key(key) {
                    std::cmp::Ordering::Equal => {
                        if cur.value_ptr().is_null() {
                            return None;
                        }

                        cur.lock();
                        if cur.is_removed() {
                            // SAFETY: Locked just above.
                            unsafe { cur.unlock() };
                            trace_log!("remove restart: node removed mid-descent");
                            continue 'restart;
                        }

                        let value = locked_value_ptr(cur);
                        if value.is_null() {
                            // SAFETY: Locked above.
                            unsafe { cur.unlock() };
                            return None;
                        }

                        cur.set_value(StdPtr::null_mut());
                        // SAFETY: Locked above.
                        unsafe { cur.unlock() };

                        // SAFETY: The slot's reference is still pending
                        // retirement, so the count is nonzero.
                        let previous = unsafe { value_clone_raw(value) };
                        // SAFETY: The slot's owning reference is released
                        // exactly once, after the grace period.
                        unsafe { guard.defer_retire(value, reclaim_value::<V>) };
                        return Some((previous, current));
                    }

                    std::cmp::Ordering::Less => next = cur.left(),

                    std::cmp::Ordering::Greater => next = cur.right(),
                }

                if next.is_null() {
                    return None;
                }
            }
        }
    }

    /// Lock `node.parent` with a bounded number of try-lock attempts.
    ///
    /// `conflicts` accumulates across one maintenance invocation; the
    /// walk gives up once the configured budget is spent. A `Some`
    /// return holds the parent's lock with `node.parent` revalidated.
    pub(crate) fn try_lock_parent(
        &self,
        node: *mut Node<K, V>,
        conflicts: &mut u64,
    ) -> Option<*mut Node<K, V>> {
        for _ in 0..self.config.spin_count {
            if *conflicts >= u64::from(self.config.conflicts) {
                return None;
            }

            // SAFETY: node is locked by the caller, so it is not freed.
            let parent = unsafe { &*node }.parent();
            // SAFETY: A locked node's parent pointer targets a node that
            // cannot be reclaimed while the caller's guard is held.
            let p = unsafe { &*parent };

            if p.try_lock() {
                // SAFETY: node valid as above.
                if unsafe { &*node }.parent() == parent {
                    return Some(parent);
                }
                // SAFETY: Locked two lines up.
                unsafe { p.unlock() };
            }

            self.stats.local().failed_lock_acquire.fetch_add(1, STAT_ORD);
            *conflicts += 1;
        }
        None
    }

    /// Physically splice `node` out from under `parent`.
    ///
    /// Caller holds both locks. Fails (benignly) if the parent/child
    /// relationship dissolved or the node regained a second child.
    pub(crate) fn attempt_unlink_locked(
        &self,
        parent: *mut Node<K, V>,
        node: *mut Node<K, V>,
        guard: &LocalGuard<'_>,
    ) -> bool {
        // SAFETY: Both locked by the caller.
        let p = unsafe { &*parent };
        let n = unsafe { &*node };
        debug_assert!(!p.is_removed());

        let parent_l = p.left();
        let parent_r = p.right();
        if parent_l != node && parent_r != node {
            return false;
        }

        debug_assert!(!n.is_removed());
        debug_assert_eq!(n.parent(), parent);

        let left = n.left();
        let right = n.right();
        if !left.is_null() && !right.is_null() {
            return false;
        }
        debug_assert!(n.value_ptr().is_null(), "unlink of a live node");

        let splice = if left.is_null() { right } else { left };

        if parent_l == node {
            p.set_left(splice);
        } else {
            p.set_right(splice);
        }
        if !splice.is_null() {
            // SAFETY: splice is a live child; both its old and new parent
            // are locked.
            unsafe { &*splice }.set_parent(parent);
        }

        n.mark_removed();

        let local = self.stats.local();
        local.real_nodes_deleted.fetch_add(1, STAT_ORD);
        local.struct_mods.fetch_add(1, STAT_ORD);

        // SAFETY: node is unreachable by new traversals; in-flight
        // readers are covered by the grace period.
        unsafe { guard.defer_retire(node, reclaim_node::<K, V>) };
        true
    }

}

impl<K: Ord + Clone, V> TreeCore<K, V> {
    /// Least live key strictly greater than `bound` (least overall when
    /// `bound` is `None`). Tombstones found at the frontier are skipped
    /// by re-searching above them.
    pub(crate) fn next_above(
        &self,
        mut bound: Option<K>,
        _guard: &LocalGuard<'_>,
    ) -> Option<(K, Arc<V>)> {
        loop {
            let mut candidate: *mut Node<K, V> = StdPtr::null_mut();
            // SAFETY: holder is valid for the map's lifetime.
            let mut cur = unsafe { &*self.holder }.left();

            while !cur.is_null() {
                // SAFETY: Reachable node under the caller's guard.
                let node = unsafe { &*cur };
                let above = match &bound {
                    None => true,
                    Some(b) => node.user_key() > b,
                };
                if above {
                    candidate = cur;
                    cur = node.left();
                } else {
                    cur = node.right();
                }
            }

            if candidate.is_null() {
                return None;
            }
            // SAFETY: Reachable node under the caller's guard.
            let node = unsafe { &*candidate };
            let key = node.clone_key();
            let value = node.value_ptr();
            if value.is_null() {
                bound = Some(key);
                continue;
            }
            // SAFETY: Loaded from a reachable slot under the guard.
            let value = unsafe { value_clone_raw(value) };
            return Some((key, value));
        }
    }
}

impl<K, V> Drop for TreeCore<K, V> {
    fn drop(&mut self) {
        // SAFETY: Drop has exclusive access. Live nodes (including the
        // holder) are freed here; individually retired nodes are freed
        // when the collector drops right after.
        unsafe { reclaim_subtree(self.holder, &self.collector) };
    }
}

/// Drop a never-published spare leaf, releasing its value reference.
fn discard_spare<K, V>(spare: Box<Node<K, V>>) {
    let value = spare.swap_value(StdPtr::null_mut());
    if !value.is_null() {
        // SAFETY: The spare was never linked, so this thread holds the
        // only reference to the slot.
        drop(unsafe { value_from_raw(value) });
    }
    drop(spare);
}

// ============================================================================
//  Iterator
// ============================================================================

/// Weakly-consistent cursor over a contention-friendly tree.
///
/// Each step is a fresh least-key-above search, so keys inserted behind
/// the cursor are not revisited and every key live for the cursor's
/// whole lifetime is yielded exactly once.
pub struct FriendlyIter<'a, K, V> {
    core: &'a TreeCore<K, V>,
    guard: LocalGuard<'a>,
    bound: Option<K>,
}

impl<'a, K, V> FriendlyIter<'a, K, V> {
    pub(crate) fn new(core: &'a TreeCore<K, V>) -> Self {
        Self {
            core,
            guard: core.guard(),
            bound: None,
        }
    }
}

impl<K: Ord + Clone, V> Iterator for FriendlyIter<'_, K, V> {
    type Item = (K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.core.next_above(self.bound.take(), &self.guard)?;
        self.bound = Some(key.clone());
        Some((key, value))
    }
}
