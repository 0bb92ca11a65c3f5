//! Optimistic-version splay map.
//!
//! A relaxed-balance binary search tree in the style of Bronson, Casper,
//! Chafi, and Olukotun's practical concurrent BST: readers take no locks
//! and instead validate per-node `changeOVL` version words hand over
//! hand. A reader that observes the same non-changing word before and
//! after following a link knows no rotation rerouted it in between; a
//! failed validation retries from the deepest still-valid ancestor.
//!
//! Writers lock only the nodes they modify. Removal of a node with two
//! children leaves a routing node (null value slot); rebalancing is a
//! probabilistic splay pass that rotates accessed nodes toward the root
//! and opportunistically unlinks routing nodes it passes.

mod node;
mod ovl;
mod splay;

use std::ptr as StdPtr;
use std::sync::Arc;

use seize::{Collector, Guard, LocalGuard};

use crate::config::TreeConfig;
use crate::map::ConcurrentMap;
use crate::ordering::STAT_ORD;
use crate::stats::{Stats, StatsSnapshot};
use crate::tracing_helpers::trace_log;
use crate::value::{reclaim_value, value_clone_raw, value_from_raw, value_into_raw};

use node::{Dir, Node};
use ovl::{
    OvlMasks, UNLINKED_OVL, is_shrinking_or_unlinked, is_unlinked,
};

/// Outcome of one optimistic attempt: a result, or a retry demanded by
/// failed version validation.
enum Attempt<T> {
    Done(T),
    Retry,
}

/// Which previous-value states allow an update to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateMode {
    Always,
    IfAbsent,
    IfPresent,
}

fn should_update(mode: UpdateMode, prev_present: bool) -> bool {
    match mode {
        UpdateMode::Always => true,
        UpdateMode::IfAbsent => !prev_present,
        UpdateMode::IfPresent => prev_present,
    }
}

// ============================================================================
//  Reclaimers
// ============================================================================

/// Free one retired node box; never touches children or the value slot.
pub(crate) unsafe fn reclaim_node<K, V>(ptr: *mut Node<K, V>, _collector: &Collector) {
    // SAFETY: ptr came from Box::into_raw and seize ran the grace period.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Free a detached live subtree plus the value references it owns.
pub(crate) unsafe fn reclaim_subtree<K, V>(root: *mut Node<K, V>, _collector: &Collector) {
    let mut stack: Vec<*mut Node<K, V>> = Vec::with_capacity(64);
    stack.push(root);

    while let Some(ptr) = stack.pop() {
        if ptr.is_null() {
            continue;
        }
        // SAFETY: The subtree was detached before retirement; its nodes
        // are live and form a tree.
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
//  Map
// ============================================================================

/// A concurrent ordered map using optimistic version validation for
/// reads and probabilistic splaying for self-adjustment.
pub struct OptimisticSplayMap<K, V> {
    holder: *mut Node<K, V>,
    collector: Collector,
    config: TreeConfig,
    masks: OvlMasks,
    stats: Stats,
}

// SAFETY: All shared state is guarded by per-node locks, version words,
// and the seize grace period; raw pointers never escape the protocol.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for OptimisticSplayMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for OptimisticSplayMap<K, V> {}

impl<K, V> OptimisticSplayMap<K, V> {
    /// Create an empty map with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default())
    }

    /// Create an empty map with an explicit configuration.
    #[must_use]
    pub fn with_config(config: TreeConfig) -> Self {
        let masks = OvlMasks::new(config.ovl_bits_before_overflow);
        Self {
            holder: Box::into_raw(Box::new(Node::holder())),
            collector: Collector::new(),
            config,
            masks,
            stats: Stats::new(),
        }
    }

    /// Aggregate operation statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    // SAFETY NOTE: holder is allocated in the constructors and freed only
    // in Drop, so dereferencing it from any method is sound.
    fn holder_ref(&self) -> &Node<K, V> {
        // SAFETY: See note above.
        unsafe { &*self.holder }
    }

    /// Longest root-to-leaf path, counting routing nodes. Meant for
    /// quiescent shape inspection.
    #[must_use]
    pub fn height(&self) -> usize {
        let _guard = self.guard();
        let mut max_depth = 0_usize;
        let mut stack: Vec<(*mut Node<K, V>, usize)> = Vec::with_capacity(64);
        stack.push((self.holder_ref().right(), 0));

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
}

impl<K, V> Default for OptimisticSplayMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for OptimisticSplayMap<K, V> {
    fn drop(&mut self) {
        // SAFETY: Drop has exclusive access. The live tree (holder
        // included) is freed here; individually retired nodes are freed
        // when the collector drops right after.
        unsafe { reclaim_subtree(self.holder, &self.collector) };
    }
}

impl<K: Ord + Clone, V> OptimisticSplayMap<K, V> {
    // ========================================================================
    //  Get (hand-over-hand validation)
    // ========================================================================

    fn get_impl(&self, key: &K, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        let mut traversed: u64 = 0;

        let result = loop {
            let right = self.holder_ref().right();
            traversed += 1;

            if right.is_null() {
                break None;
            }
            // SAFETY: Reachable node under the caller's guard.
            let r = unsafe { &*right };
            let cmp = r.cmp_key(key);

            if cmp == std::cmp::Ordering::Equal {
                // Who cares how we got here: the match is the
                // linearization point.
                let value = r.value_ptr();
                if value.is_null() {
                    break None;
                }
                // SAFETY: Loaded from a reachable slot under the guard.
                break Some(unsafe { value_clone_raw(value) });
            }

            let ovl = r.ovl();
            if is_shrinking_or_unlinked(ovl) {
                r.wait_until_change_completed(ovl, &self.config);
                // RETRY
            } else if right == self.holder_ref().right() {
                // The reread of .right is the read protected by ovl.
                let dir = if cmp == std::cmp::Ordering::Less {
                    Dir::Left
                } else {
                    Dir::Right
                };
                match self.attempt_get(key, right, dir, ovl, 1, &mut traversed, guard) {
                    Attempt::Done(value) => break value,
                    Attempt::Retry => {}
                }
            }
        };

        let local = self.stats.local();
        local.get_count.fetch_add(1, STAT_ORD);
        local.nodes_traversed.fetch_add(traversed, STAT_ORD);
        result
    }

    #[expect(clippy::too_many_arguments, reason = "hand-over-hand state travels together")]
    fn attempt_get(
        &self,
        key: &K,
        node: *mut Node<K, V>,
        dir_to_c: Dir,
        node_ovl: u64,
        depth: u64,
        traversed: &mut u64,
        guard: &LocalGuard<'_>,
    ) -> Attempt<Option<Arc<V>>> {
        // SAFETY: node was validated reachable by the caller and the
        // guard keeps it alive.
        let n = unsafe { &*node };

        loop {
            let child = n.child(dir_to_c);
            *traversed += 1;

            if child.is_null() {
                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    return Attempt::Retry;
                }
                // The key is not present. The read of node.child occurred
                // while parent.child was valid, so no shrink affected us.
                return Attempt::Done(None);
            }

            // SAFETY: Loaded from node's child slot under the guard.
            let c = unsafe { &*child };
            let child_cmp = c.cmp_key(key);

            if child_cmp == std::cmp::Ordering::Equal {
                // How we got here is irrelevant.
                self.splay(child, depth, guard);
                let value = c.value_ptr();
                if value.is_null() {
                    return Attempt::Done(None);
                }
                // SAFETY: Loaded from a reachable slot under the guard.
                return Attempt::Done(Some(unsafe { value_clone_raw(value) }));
            }

            let child_ovl = c.ovl();
            if is_shrinking_or_unlinked(child_ovl) {
                c.wait_until_change_completed(child_ovl, &self.config);

                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    return Attempt::Retry;
                }
                // else RETRY this level
            } else if child != n.child(dir_to_c) {
                // This second read is the one protected by child_ovl.
                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    return Attempt::Retry;
                }
                // else RETRY this level
            } else {
                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    return Attempt::Retry;
                }

                // Both traversals (parent->node and node->child) were
                // valid just before the validation above, so node shrinks
                // can no longer affect us; descend without revisiting
                // node_ovl.
                let dir = if child_cmp == std::cmp::Ordering::Less {
                    Dir::Left
                } else {
                    Dir::Right
                };
                match self.attempt_get(key, child, dir, child_ovl, depth + 1, traversed, guard) {
                    Attempt::Done(value) => return Attempt::Done(value),
                    Attempt::Retry => {}
                }
            }
        }
    }

    // ========================================================================
    //  Update (insert / revive / remove)
    // ========================================================================

    fn update(
        &self,
        key: &K,
        mode: UpdateMode,
        new_value: Option<Arc<V>>,
        guard: &LocalGuard<'_>,
    ) -> Option<Arc<V>> {
        loop {
            let right = self.holder_ref().right();

            if right.is_null() {
                // Key is not present.
                if !should_update(mode, false) || new_value.is_none() {
                    return None;
                }
                let value = new_value.clone().unwrap_or_else(|| unreachable!());
                if self.attempt_insert_into_empty(key, value, guard) {
                    return None;
                }
                // else RETRY
            } else {
                // SAFETY: Reachable node under the caller's guard.
                let r = unsafe { &*right };
                let ovl = r.ovl();
                if is_shrinking_or_unlinked(ovl) {
                    r.wait_until_change_completed(ovl, &self.config);
                    // RETRY
                } else if right == self.holder_ref().right() {
                    // This is the protected read of .right.
                    match self.attempt_update(key, mode, &new_value, self.holder, right, ovl, guard)
                    {
                        Attempt::Done(previous) => return previous,
                        Attempt::Retry => {}
                    }
                }
            }
        }
    }

    fn attempt_insert_into_empty(
        &self,
        key: &K,
        value: Arc<V>,
        _guard: &LocalGuard<'_>,
    ) -> bool {
        let holder = self.holder_ref();
        holder.lock();

        let installed = if holder.right().is_null() {
            let leaf = Box::into_raw(Box::new(Node::leaf(
                key.clone(),
                value_into_raw(value),
                self.holder,
            )));
            holder.set_right(leaf);
            true
        } else {
            false
        };

        // SAFETY: Locked above.
        unsafe { holder.unlock() };
        installed
    }

    /// One validated descent step of an update.
    ///
    /// As the search progresses there is an implicit min and max for the
    /// branch rooted at `node`. A rotation of `node` shrinks the key
    /// range of one of its branches, so before following a link we must
    /// confirm `node` has not been rotated since we arrived from the
    /// parent. Once we have moved on to the child, rotations of `node`
    /// can no longer mislead us - the validation chain is a sequence of
    /// small read-only transactions, not one big one.
    #[expect(clippy::too_many_arguments, reason = "hand-over-hand state travels together")]
    fn attempt_update(
        &self,
        key: &K,
        mode: UpdateMode,
        new_value: &Option<Arc<V>>,
        parent: *mut Node<K, V>,
        node: *mut Node<K, V>,
        node_ovl: u64,
        guard: &LocalGuard<'_>,
    ) -> Attempt<Option<Arc<V>>> {
        debug_assert!(node_ovl != UNLINKED_OVL);

        // SAFETY: node was validated reachable by the caller.
        let n = unsafe { &*node };
        let cmp = n.cmp_key(key);
        if cmp == std::cmp::Ordering::Equal {
            return self.attempt_node_update(mode, new_value, parent, node, node_ovl, guard);
        }

        let dir_to_c = if cmp == std::cmp::Ordering::Less {
            Dir::Left
        } else {
            Dir::Right
        };

        loop {
            let child = n.child(dir_to_c);

            if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                return Attempt::Retry;
            }

            if child.is_null() {
                // Key is not present.
                if new_value.is_none() {
                    // Removal of an absent key; the child read above was
                    // protected, so no shrink affected us.
                    return Attempt::Done(None);
                }

                // The update is an insert.
                n.lock();
                // We hold node's lock, so no future rotation can pass;
                // validate we were not affected by past ones.
                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    // SAFETY: Locked above.
                    unsafe { n.unlock() };
                    return Attempt::Retry;
                }

                if n.child(dir_to_c).is_null() {
                    if !should_update(mode, false) {
                        // SAFETY: Locked above.
                        unsafe { n.unlock() };
                        return Attempt::Done(None);
                    }

                    let value = new_value.clone().unwrap_or_else(|| unreachable!());
                    let leaf = Box::into_raw(Box::new(Node::leaf(
                        key.clone(),
                        value_into_raw(value),
                        node,
                    )));
                    n.set_child(dir_to_c, leaf);
                    // SAFETY: Locked above.
                    unsafe { n.unlock() };
                    return Attempt::Done(None);
                }

                // Lost a race with a concurrent insert. No need to back
                // up to the parent, but this method's outer loop must
                // retry.
                // SAFETY: Locked above.
                unsafe { n.unlock() };
            } else {
                // SAFETY: Loaded from node's child slot under the guard.
                let c = unsafe { &*child };
                let child_ovl = c.ovl();

                if is_shrinking_or_unlinked(child_ovl) {
                    c.wait_until_change_completed(child_ovl, &self.config);
                    // RETRY this level
                } else if child != n.child(dir_to_c) {
                    // The second read is the one protected by child_ovl.
                    // RETRY this level
                } else {
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }

                    match self.attempt_update(key, mode, new_value, node, child, child_ovl, guard) {
                        Attempt::Done(previous) => return Attempt::Done(previous),
                        Attempt::Retry => {}
                    }
                }
            }
        }
    }

    /// Update the matched node's value in place, or unlink it.
    ///
    /// `parent` is only used for the unlink; a plain value update can
    /// proceed even if it is stale.
    fn attempt_node_update(
        &self,
        mode: UpdateMode,
        new_value: &Option<Arc<V>>,
        parent: *mut Node<K, V>,
        node: *mut Node<K, V>,
        node_ovl: u64,
        guard: &LocalGuard<'_>,
    ) -> Attempt<Option<Arc<V>>> {
        // SAFETY: Both were validated reachable by the caller.
        let n = unsafe { &*node };

        if new_value.is_none() && n.value_ptr().is_null() {
            // Already logically absent, nothing to do.
            return Attempt::Done(None);
        }

        if new_value.is_none() && (n.left().is_null() || n.right().is_null()) {
            // Potential unlink; lock node then parent.
            n.lock();
            if n.ovl() != node_ovl {
                // SAFETY: Locked above.
                unsafe { n.unlock() };
                return Attempt::Retry;
            }

            // SAFETY: parent stays valid under the guard.
            let p = unsafe { &*parent };
            p.lock();
            if n.parent() != parent || is_unlinked(p.ovl()) {
                // SAFETY: Both locked above.
                unsafe {
                    p.unlock();
                    n.unlock();
                }
                return Attempt::Retry;
            }

            let prev = n.value_ptr();
            if prev.is_null() || !should_update(mode, true) {
                let result = if prev.is_null() {
                    None
                } else {
                    // SAFETY: Loaded under the node lock.
                    Some(unsafe { value_clone_raw(prev) })
                };
                // SAFETY: Both locked above.
                unsafe {
                    p.unlock();
                    n.unlock();
                }
                return Attempt::Done(result);
            }

            // Clone before the unlink retires the slot's reference.
            // SAFETY: Loaded under the node lock.
            let previous = unsafe { value_clone_raw(prev) };
            let unlinked = self.attempt_unlink_locked(parent, node, guard);
            // SAFETY: Both locked above.
            unsafe {
                p.unlock();
                n.unlock();
            }
            if unlinked {
                Attempt::Done(Some(previous))
            } else {
                Attempt::Retry
            }
        } else {
            // Potential update, including remove-without-unlink.
            n.lock();
            // Regular version changes don't bother us.
            if is_unlinked(n.ovl()) {
                // SAFETY: Locked above.
                unsafe { n.unlock() };
                return Attempt::Retry;
            }

            let prev = n.value_ptr();
            let prev_present = !prev.is_null();
            if !should_update(mode, prev_present) {
                let result = if prev_present {
                    // SAFETY: Loaded under the node lock.
                    Some(unsafe { value_clone_raw(prev) })
                } else {
                    None
                };
                // SAFETY: Locked above.
                unsafe { n.unlock() };
                return Attempt::Done(result);
            }

            // Retry if an unlink has become possible after all.
            if new_value.is_none() && (n.left().is_null() || n.right().is_null()) {
                // SAFETY: Locked above.
                unsafe { n.unlock() };
                return Attempt::Retry;
            }

            let fresh = new_value
                .clone()
                .map_or(StdPtr::null_mut(), value_into_raw);
            n.set_value(fresh);
            // SAFETY: Locked above.
            unsafe { n.unlock() };

            let result = if prev_present {
                // SAFETY: The slot's reference is pending retirement.
                Some(unsafe { value_clone_raw(prev) })
            } else {
                None
            };
            if prev_present {
                // SAFETY: The slot's owning reference is released once,
                // after the grace period.
                unsafe { guard.defer_retire(prev, reclaim_value::<V>) };
            }
            Attempt::Done(result)
        }
    }

    /// Splice a locked node out from under its locked parent. Does not
    /// adjust any heights.
    fn attempt_unlink_locked(
        &self,
        parent: *mut Node<K, V>,
        node: *mut Node<K, V>,
        guard: &LocalGuard<'_>,
    ) -> bool {
        // SAFETY: Both locked by the caller.
        let p = unsafe { &*parent };
        let n = unsafe { &*node };
        debug_assert!(!is_unlinked(p.ovl()));

        let parent_l = p.left();
        let parent_r = p.right();
        if parent_l != node && parent_r != node {
            // node is no longer a child of parent
            return false;
        }

        debug_assert!(!is_unlinked(n.ovl()));
        debug_assert_eq!(n.parent(), parent);

        let left = n.left();
        let right = n.right();
        if !left.is_null() && !right.is_null() {
            // Splicing is no longer possible.
            return false;
        }
        let splice = if left.is_null() { right } else { left };

        if parent_l == node {
            p.set_left(splice);
        } else {
            p.set_right(splice);
        }
        if !splice.is_null() {
            // SAFETY: splice is a live child; its old and new parents
            // are locked.
            unsafe { &*splice }.set_parent(parent);
        }

        n.set_ovl(UNLINKED_OVL);
        let old_value = n.swap_value(StdPtr::null_mut());
        if !old_value.is_null() {
            // SAFETY: The slot's owning reference is released once,
            // after the grace period.
            unsafe { guard.defer_retire(old_value, reclaim_value::<V>) };
        }

        let local = self.stats.local();
        local.real_nodes_deleted.fetch_add(1, STAT_ORD);
        local.struct_mods.fetch_add(1, STAT_ORD);
        trace_log!("optimistic unlink");

        // SAFETY: Unreachable by new traversals; readers still parked on
        // it observe UNLINKED and retry, and the grace period covers
        // their references.
        unsafe { guard.defer_retire(node, reclaim_node::<K, V>) };
        true
    }

    // ========================================================================
    //  Extremes and ordered scans (validated)
    // ========================================================================

    /// Extreme node in direction `dir`, or `None` for an empty tree.
    fn extreme_node(&self, dir: Dir, _guard: &LocalGuard<'_>) -> Option<*mut Node<K, V>> {
        loop {
            let right = self.holder_ref().right();
            if right.is_null() {
                return None;
            }
            // SAFETY: Reachable node under the caller's guard.
            let r = unsafe { &*right };
            let ovl = r.ovl();
            if is_shrinking_or_unlinked(ovl) {
                r.wait_until_change_completed(ovl, &self.config);
                // RETRY
            } else if right == self.holder_ref().right() {
                // The reread of .right is the one protected by ovl.
                match self.attempt_extreme(dir, right, ovl) {
                    Attempt::Done(found) => return Some(found),
                    Attempt::Retry => {}
                }
            }
        }
    }

    fn attempt_extreme(
        &self,
        dir: Dir,
        node: *mut Node<K, V>,
        node_ovl: u64,
    ) -> Attempt<*mut Node<K, V>> {
        // SAFETY: Validated reachable by the caller.
        let n = unsafe { &*node };

        loop {
            let child = n.child(dir);

            if child.is_null() {
                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    return Attempt::Retry;
                }
                return Attempt::Done(node);
            }

            // SAFETY: Loaded from node's child slot under the guard held
            // by the caller.
            let c = unsafe { &*child };
            let child_ovl = c.ovl();
            if is_shrinking_or_unlinked(child_ovl) {
                c.wait_until_change_completed(child_ovl, &self.config);

                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    return Attempt::Retry;
                }
                // else RETRY this level
            } else if child != n.child(dir) {
                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    return Attempt::Retry;
                }
                // else RETRY this level
            } else {
                if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                    return Attempt::Retry;
                }

                match self.attempt_extreme(dir, child, child_ovl) {
                    Attempt::Done(found) => return Attempt::Done(found),
                    Attempt::Retry => {}
                }
            }
        }
    }

    /// Least node with key strictly greater than `key`, validated the
    /// same way as a lookup.
    fn succ_node_above(&self, key: &K, _guard: &LocalGuard<'_>) -> Option<*mut Node<K, V>> {
        loop {
            let right = self.holder_ref().right();
            if right.is_null() {
                return None;
            }
            // SAFETY: Reachable node under the caller's guard.
            let r = unsafe { &*right };
            let ovl = r.ovl();
            if is_shrinking_or_unlinked(ovl) {
                r.wait_until_change_completed(ovl, &self.config);
                // RETRY
            } else if right == self.holder_ref().right() {
                match self.attempt_succ_above(key, right, ovl) {
                    Attempt::Done(found) => return found,
                    Attempt::Retry => {}
                }
            }
        }
    }

    fn attempt_succ_above(
        &self,
        key: &K,
        node: *mut Node<K, V>,
        node_ovl: u64,
    ) -> Attempt<Option<*mut Node<K, V>>> {
        // SAFETY: Validated reachable by the caller.
        let n = unsafe { &*node };

        loop {
            let cmp = n.cmp_key(key);

            if cmp != std::cmp::Ordering::Less {
                // node.key <= key, so the successor is on the right.
                let right = n.right();
                if right.is_null() {
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }
                    return Attempt::Done(None);
                }

                // SAFETY: Loaded from node's child slot.
                let r = unsafe { &*right };
                let right_ovl = r.ovl();
                if is_shrinking_or_unlinked(right_ovl) {
                    r.wait_until_change_completed(right_ovl, &self.config);
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }
                    // else RETRY this level
                } else if right != n.right() {
                    // The second read is the one protected by right_ovl.
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }
                    // else RETRY this level
                } else {
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }
                    match self.attempt_succ_above(key, right, right_ovl) {
                        Attempt::Done(found) => return Attempt::Done(found),
                        Attempt::Retry => {}
                    }
                }
            } else {
                // The successor is on the left branch or is node itself.
                let left = n.left();
                if left.is_null() {
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }
                    return Attempt::Done(Some(node));
                }

                // SAFETY: Loaded from node's child slot.
                let l = unsafe { &*left };
                let left_ovl = l.ovl();
                if is_shrinking_or_unlinked(left_ovl) {
                    l.wait_until_change_completed(left_ovl, &self.config);
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }
                    // else RETRY this level
                } else if left != n.left() {
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }
                    // else RETRY this level
                } else {
                    if self.masks.has_shrunk_or_unlinked(node_ovl, n.ovl()) {
                        return Attempt::Retry;
                    }
                    match self.attempt_succ_above(key, left, left_ovl) {
                        Attempt::Done(found) => {
                            return Attempt::Done(found.or(Some(node)));
                        }
                        Attempt::Retry => {}
                    }
                }
            }
        }
    }

    /// Least live mapping with key strictly above `bound` (least overall
    /// for `None`). Routing nodes are skipped.
    fn next_above(&self, bound: Option<&K>, guard: &LocalGuard<'_>) -> Option<(K, Arc<V>)> {
        let mut cursor: Option<K> = bound.cloned();
        loop {
            let found = match &cursor {
                None => self.extreme_node(Dir::Left, guard)?,
                Some(b) => self.succ_node_above(b, guard)?,
            };
            // SAFETY: Reachable node under the caller's guard.
            let node = unsafe { &*found };
            let key = node.clone_key();
            let value = node.value_ptr();
            cursor = Some(key.clone());
            if value.is_null() {
                continue;
            }
            // SAFETY: Loaded from a reachable slot under the guard.
            return Some((key, unsafe { value_clone_raw(value) }));
        }
    }

    /// First (least) live mapping.
    #[must_use]
    pub fn first_key_value(&self) -> Option<(K, Arc<V>)> {
        let guard = self.guard();
        self.next_above(None, &guard)
    }

    /// Last (greatest) live mapping.
    #[must_use]
    pub fn last_key_value(&self) -> Option<(K, Arc<V>)> {
        let guard = self.guard();
        let found = self.extreme_node(Dir::Right, &guard)?;
        // SAFETY: Reachable node under the guard above.
        let node = unsafe { &*found };
        let value = node.value_ptr();
        if !value.is_null() {
            // SAFETY: Loaded from a reachable slot under the guard.
            return Some((node.clone_key(), unsafe { value_clone_raw(value) }));
        }

        // The rightmost node is a routing node; fall back to a scan.
        let mut last = None;
        let mut cursor: Option<K> = None;
        while let Some((key, val)) = self.next_above(cursor.as_ref(), &guard) {
            cursor = Some(key.clone());
            last = Some((key, val));
        }
        last
    }

    /// Weakly-consistent cursor over the live mappings in key order.
    pub fn iter(&self) -> OptimisticIter<'_, K, V> {
        OptimisticIter {
            map: self,
            guard: self.guard(),
            bound: None,
        }
    }

    /// Unconditional insert-or-replace; returns the previous value.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.update(&key, UpdateMode::Always, Some(Arc::new(value)), &guard)
    }

    /// Replace only if a live mapping exists; returns the previous value.
    pub fn replace(&self, key: &K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.update(key, UpdateMode::IfPresent, Some(Arc::new(value)), &guard)
    }
}

impl<K: Ord + Clone, V> ConcurrentMap<K, V> for OptimisticSplayMap<K, V> {
    fn get(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.guard();
        self.get_impl(key, &guard)
    }

    fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.update(&key, UpdateMode::IfAbsent, Some(Arc::new(value)), &guard)
    }

    fn remove(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.guard();
        self.update(key, UpdateMode::Always, None, &guard)
    }

    fn len(&self) -> usize {
        let guard = self.guard();
        let mut count = 0_usize;
        let mut cursor: Option<K> = None;
        while let Some((key, _)) = self.next_above(cursor.as_ref(), &guard) {
            cursor = Some(key);
            count += 1;
        }
        count
    }

    fn is_empty(&self) -> bool {
        // Removed-but-not-unlinked nodes cannot be leaves, so a truly
        // empty tree leaves the holder with no right child.
        self.holder_ref().right().is_null()
    }

    fn clear(&self) {
        let guard = self.guard();
        let holder = self.holder_ref();

        holder.lock();
        let old = holder.right();
        holder.set_right(StdPtr::null_mut());
        // SAFETY: Locked above.
        unsafe { holder.unlock() };

        if !old.is_null() {
            // SAFETY: The subtree is detached; readers that entered
            // before the swap are covered by the grace period.
            unsafe { guard.defer_retire(old, reclaim_subtree::<K, V>) };
        }
    }
}

/// Weakly-consistent cursor; each step is a validated successor search.
pub struct OptimisticIter<'a, K, V> {
    map: &'a OptimisticSplayMap<K, V>,
    guard: LocalGuard<'a>,
    bound: Option<K>,
}

impl<K: Ord + Clone, V> Iterator for OptimisticIter<'_, K, V> {
    type Item = (K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.map.next_above(self.bound.as_ref(), &self.guard)?;
        self.bound = Some(key.clone());
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_round_trip() {
        let map: OptimisticSplayMap<i64, u64> = OptimisticSplayMap::new();

        assert!(map.put_if_absent(1, 10).is_none());
        assert_eq!(map.get(&1).as_deref(), Some(&10));
        assert_eq!(map.remove(&1).as_deref(), Some(&10));
        assert!(map.get(&1).is_none());
        assert!(map.remove(&1).is_none());
    }

    #[test]
    fn put_if_absent_keeps_first_value() {
        let map: OptimisticSplayMap<i64, &str> = OptimisticSplayMap::new();

        assert!(map.put_if_absent(10, "a").is_none());
        assert_eq!(map.put_if_absent(10, "b").as_deref(), Some(&"a"));
        assert_eq!(map.get(&10).as_deref(), Some(&"a"));
    }

    #[test]
    fn put_replaces_and_returns_previous() {
        let map: OptimisticSplayMap<i64, u64> = OptimisticSplayMap::new();

        assert!(map.put(7, 70).is_none());
        assert_eq!(map.put(7, 71).as_deref(), Some(&70));
        assert_eq!(map.get(&7).as_deref(), Some(&71));

        assert!(map.replace(&8, 80).is_none());
        assert!(map.get(&8).is_none());
        assert_eq!(map.replace(&7, 72).as_deref(), Some(&71));
    }

    #[test]
    fn remove_interior_key_leaves_routing_node() {
        let map: OptimisticSplayMap<i64, i64> = OptimisticSplayMap::new();
        for &k in &[5, 3, 8, 1, 4, 7, 9] {
            map.put_if_absent(k, k);
        }

        // 5 has two children; its node becomes a routing node but the
        // mapping disappears.
        assert_eq!(map.remove(&5).as_deref(), Some(&5));
        assert!(map.get(&5).is_none());
        assert_eq!(map.len(), 6);

        let keys: Vec<i64> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 3, 4, 7, 8, 9]);
    }

    #[test]
    fn extremes() {
        let map: OptimisticSplayMap<i64, i64> = OptimisticSplayMap::new();
        assert!(map.first_key_value().is_none());
        assert!(map.last_key_value().is_none());

        for &k in &[5, 3, 8] {
            map.put_if_absent(k, k * 10);
        }
        assert_eq!(map.first_key_value().map(|(k, _)| k), Some(3));
        assert_eq!(map.last_key_value().map(|(k, _)| k), Some(8));
    }

    #[test]
    fn clear_empties_the_map() {
        let map: OptimisticSplayMap<i64, i64> = OptimisticSplayMap::new();
        for i in 0..100 {
            map.put_if_absent(i, i);
        }
        map.clear();

        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
        assert!(map.get(&42).is_none());
    }
}
