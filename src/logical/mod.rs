//! Logical-ordering map.
//!
//! Presence is defined by a doubly-linked chain of nodes in key order,
//! bracketed by -inf / +inf anchors and guarded per edge by the
//! predecessor's `succ_lock`. The binary search tree over the same nodes
//! is only an accelerator: a lookup descends the tree to a near miss and
//! then walks the chain until the comparison settles, which tolerates
//! any amount of concurrent tree restructuring.
//!
//! Insertion validates the interval `(pred.key, succ.key]` under the
//! predecessor's chain lock, splices the chain, and only then attaches
//! the node to the tree. Removal splices the chain first (that is the
//! linearization point) and then unlinks from the tree, relocating the
//! in-order successor when the victim has two children - never copying
//! keys, because readers hold direct node references.
//!
//! Self-adjustment is the same probabilistic splay idea as the other
//! variants, with in-place rotations: the chain stays untouched, so
//! readers cannot be misrouted by them.

mod node;

use std::ptr as StdPtr;
use std::sync::Arc;

use rand::Rng;
use seize::{Collector, Guard, LocalGuard};

use crate::config::TreeConfig;
use crate::map::ConcurrentMap;
use crate::ordering::STAT_ORD;
use crate::stats::{Stats, StatsSnapshot};
use crate::tracing_helpers::trace_log;
use crate::value::{reclaim_value, value_clone_raw, value_from_raw, value_into_raw};

use node::{AnchorKey, Node};

/// Which previous states allow an insert-flavored operation to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertMode {
    Put,
    PutIfAbsent,
    Replace,
}

/// Free one retired node box; never touches the value slot or links.
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
        // SAFETY: Detached subtree of live nodes.
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

/// A concurrent ordered map whose ground truth is a key-ordered
/// doubly-linked chain, accelerated by a self-adjusting search tree.
pub struct LogicalOrderingMap<K, V> {
    /// The +inf anchor; also the fixed top of the search tree.
    root: *mut Node<K, V>,
    /// The -inf anchor; tree parent of `root` and head of the chain.
    anchor: *mut Node<K, V>,
    collector: Collector,
    config: TreeConfig,
    stats: Stats,
}

// SAFETY: All shared state is guarded by per-node locks, the valid flag,
// and the seize grace period; raw pointers never escape the protocol.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for LogicalOrderingMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for LogicalOrderingMap<K, V> {}

impl<K, V> LogicalOrderingMap<K, V> {
    /// Create an empty map with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default())
    }

    /// Create an empty map with an explicit configuration.
    ///
    /// The chain starts as `-inf <-> +inf`; the tree as `-inf` holding
    /// `+inf` as its right child.
    #[must_use]
    pub fn with_config(config: TreeConfig) -> Self {
        let anchor = Box::into_raw(Box::new(Node::anchor(AnchorKey::NegInf)));
        let root = Box::into_raw(Box::new(Node::anchor(AnchorKey::PosInf)));

        // SAFETY: Both were just allocated and are not shared yet.
        unsafe {
            (*root).set_parent(anchor);
            (*root).set_pred(anchor);
            (*root).set_succ(anchor);
            (*anchor).set_right(root);
            (*anchor).set_succ(root);
        }

        Self {
            root,
            anchor,
            collector: Collector::new(),
            config,
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

    // SAFETY NOTE: root and anchor are allocated in the constructors and
    // freed only in Drop, so dereferencing them is always sound.
    fn root_ref(&self) -> &Node<K, V> {
        // SAFETY: See note above.
        unsafe { &*self.root }
    }

    fn anchor_ref(&self) -> &Node<K, V> {
        // SAFETY: See note above.
        unsafe { &*self.anchor }
    }

    /// Longest root-to-leaf path of the accelerator tree. Meant for
    /// quiescent shape inspection.
    #[must_use]
    pub fn height(&self) -> usize {
        let _guard = self.guard();
        let mut max_depth = 0_usize;
        let mut stack: Vec<(*mut Node<K, V>, usize)> = Vec::with_capacity(64);
        stack.push((self.root_ref().left(), 0));

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

    fn finish_count(&self, tree: u64, logical: u64, found: bool) {
        let local = self.stats.local();
        local.get_count.fetch_add(1, STAT_ORD);
        if found {
            local.found_cnt.fetch_add(1, STAT_ORD);
            local.found_tree_traversed.fetch_add(tree, STAT_ORD);
            local.found_logical_traversed.fetch_add(logical, STAT_ORD);
        } else {
            local.not_found_cnt.fetch_add(1, STAT_ORD);
            local.not_found_tree_traversed.fetch_add(tree, STAT_ORD);
            local.not_found_logical_traversed.fetch_add(logical, STAT_ORD);
        }
    }
}

impl<K, V> Default for LogicalOrderingMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for LogicalOrderingMap<K, V> {
    fn drop(&mut self) {
        // Walk the chain: it holds exactly the anchors and the live
        // nodes. Unlinked nodes were retired individually and are freed
        // when the collector drops.
        let mut cur = self.anchor;
        loop {
            // SAFETY: Drop has exclusive access; chain nodes are live.
            let node = unsafe { &*cur };
            let next = node.succ();
            let value = node.value_ptr();
            if !value.is_null() {
                // SAFETY: A live node owns its slot's strong reference.
                drop(unsafe { value_from_raw(value) });
            }
            let at_root = cur == self.root;
            // SAFETY: cur came from Box::into_raw and is visited once.
            unsafe { drop(Box::from_raw(cur)) };
            if at_root {
                break;
            }
            cur = next;
        }
    }
}

impl<K: Ord + Clone, V> LogicalOrderingMap<K, V> {
    /// Tree descent to the near miss for `key`.
    ///
    /// Returns the last node visited, the final comparison, and the
    /// depth reached.
    fn descend(&self, key: &K, tree_traversed: &mut u64) -> (*mut Node<K, V>, std::cmp::Ordering, u64) {
        let mut node: *mut Node<K, V> = self.root;
        let mut res = std::cmp::Ordering::Less;
        let mut depth: u64 = 0;

        loop {
            if res == std::cmp::Ordering::Equal {
                break;
            }
            // SAFETY: Reachable node under the caller's guard.
            let n = unsafe { &*node };
            let child = if res == std::cmp::Ordering::Greater {
                n.right()
            } else {
                n.left()
            };
            depth += 1;
            *tree_traversed += 1;
            if child.is_null() {
                break;
            }
            node = child;
            // SAFETY: As above.
            res = unsafe { &*node }.cmp_key(key);
        }

        (node, res, depth)
    }

    fn get_impl(&self, key: &K, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        let mut tree_traversed: u64 = 0;
        let (mut node, mut res, mut depth) = self.descend(key, &mut tree_traversed);

        // Finish on the chain; it is the ground truth.
        let mut logical_traversed: u64 = 0;
        let mut walked_pred = false;
        while res == std::cmp::Ordering::Less {
            walked_pred = true;
            // SAFETY: Chain pointers of reachable nodes stay valid under
            // the guard.
            node = unsafe { &*node }.pred();
            res = unsafe { &*node }.cmp_key(key);
            logical_traversed += 1;
        }
        while !walked_pred && res == std::cmp::Ordering::Greater {
            // SAFETY: As above.
            node = unsafe { &*node }.succ();
            res = unsafe { &*node }.cmp_key(key);
            logical_traversed += 1;
        }
        if logical_traversed > 0 {
            depth = 0;
        }

        // SAFETY: As above.
        let n = unsafe { &*node };
        if res == std::cmp::Ordering::Equal && n.valid() {
            let value = n.value_ptr();
            let result = if value.is_null() {
                None
            } else {
                // SAFETY: Loaded from a reachable slot under the guard.
                Some(unsafe { value_clone_raw(value) })
            };
            self.finish_count(tree_traversed, logical_traversed, true);
            self.splay(node, depth, guard);
            return result;
        }

        self.finish_count(tree_traversed, logical_traversed, false);
        None
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    fn insert_impl(
        &self,
        key: &K,
        mode: InsertMode,
        value: Arc<V>,
        guard: &LocalGuard<'_>,
    ) -> Option<Arc<V>> {
        loop {
            let mut tree_traversed = 0;
            let (node, res, _depth) = self.descend(key, &mut tree_traversed);

            let pred = if res == std::cmp::Ordering::Greater {
                node
            } else {
                // SAFETY: Reachable node under the caller's guard.
                unsafe { &*node }.pred()
            };
            // SAFETY: As above.
            let p = unsafe { &*pred };
            p.lock_succ();

            if p.valid() {
                let pred_res = if pred == node { res } else { p.cmp_key(key) };
                if pred_res == std::cmp::Ordering::Greater {
                    let succ = p.succ();
                    // SAFETY: The chain edge is protected by p's lock.
                    let s = unsafe { &*succ };
                    let succ_res = if succ == node { res } else { s.cmp_key(key) };

                    if succ_res != std::cmp::Ordering::Greater {
                        if succ_res == std::cmp::Ordering::Equal {
                            // Key present; the chain says so.
                            let prev = s.value_ptr();
                            // SAFETY: Valid chain nodes hold a value;
                            // the edge lock pins it.
                            let previous = unsafe { value_clone_raw(prev) };
                            if mode != InsertMode::PutIfAbsent {
                                let old = s.swap_value(value_into_raw(value));
                                // SAFETY: Released once after the grace
                                // period.
                                unsafe { guard.defer_retire(old, reclaim_value::<V>) };
                            }
                            // SAFETY: Locked above.
                            unsafe { p.unlock_succ() };
                            return Some(previous);
                        }

                        if mode == InsertMode::Replace {
                            // SAFETY: Locked above.
                            unsafe { p.unlock_succ() };
                            return None;
                        }

                        let parent = self.choose_parent(pred, succ, node);
                        let fresh = Box::into_raw(Box::new(Node::new(
                            key.clone(),
                            value_into_raw(value),
                            pred,
                            succ,
                            parent,
                        )));
                        s.set_pred(fresh);
                        p.set_succ(fresh);
                        // SAFETY: Locked above.
                        unsafe { p.unlock_succ() };
                        self.insert_to_tree(parent, fresh, parent == pred);
                        return None;
                    }
                }
            }

            // SAFETY: Locked above.
            unsafe { p.unlock_succ() };
            trace_log!("insert restart: chain interval moved");
        }
    }

    /// Choose and tree-lock the node the new node will hang off: the
    /// predecessor if its right slot is free, otherwise the successor's
    /// left slot (one of the two is always free for a fresh key).
    fn choose_parent(
        &self,
        pred: *mut Node<K, V>,
        succ: *mut Node<K, V>,
        first_candidate: *mut Node<K, V>,
    ) -> *mut Node<K, V> {
        let mut candidate = if first_candidate == pred || first_candidate == succ {
            first_candidate
        } else {
            pred
        };

        loop {
            // SAFETY: pred and succ are pinned by the chain-edge lock the
            // caller holds.
            let c = unsafe { &*candidate };
            c.lock_tree();
            if candidate == pred {
                if c.right().is_null() {
                    return candidate;
                }
                // SAFETY: Locked above.
                unsafe { c.unlock_tree() };
                candidate = succ;
            } else {
                if c.left().is_null() {
                    return candidate;
                }
                // SAFETY: Locked above.
                unsafe { c.unlock_tree() };
                candidate = pred;
            }
            std::thread::yield_now();
        }
    }

    /// Attach the already-chained node to its tree parent and release
    /// the parent's tree lock.
    fn insert_to_tree(&self, parent: *mut Node<K, V>, fresh: *mut Node<K, V>, is_right: bool) {
        // SAFETY: parent's tree lock is held (from choose_parent).
        let p = unsafe { &*parent };
        if is_right {
            p.set_right(fresh);
        } else {
            p.set_left(fresh);
        }
        // SAFETY: Locked by choose_parent.
        unsafe { p.unlock_tree() };
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    fn remove_impl(&self, key: &K, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        loop {
            let mut tree_traversed = 0;
            let (node, res, _depth) = self.descend(key, &mut tree_traversed);

            let pred = if res == std::cmp::Ordering::Greater {
                node
            } else {
                // SAFETY: Reachable node under the caller's guard.
                unsafe { &*node }.pred()
            };
            // SAFETY: As above.
            let p = unsafe { &*pred };
            p.lock_succ();

            if p.valid() {
                let pred_res = if pred == node { res } else { p.cmp_key(key) };
                if pred_res == std::cmp::Ordering::Greater {
                    let victim = p.succ();
                    // SAFETY: The chain edge is protected by p's lock.
                    let v = unsafe { &*victim };
                    let succ_res = if victim == node { res } else { v.cmp_key(key) };

                    if succ_res != std::cmp::Ordering::Greater {
                        if succ_res != std::cmp::Ordering::Equal {
                            // SAFETY: Locked above.
                            unsafe { p.unlock_succ() };
                            return None;
                        }

                        v.lock_succ();
                        let relocated = self.acquire_tree_locks(victim);
                        let victim_parent = self.lock_tree_parent(victim);

                        // Linearization point: the chain splice.
                        v.set_invalid();
                        let value = v.value_ptr();
                        // SAFETY: Valid until this splice; the guard pins
                        // the allocation.
                        let previous = unsafe { value_clone_raw(value) };

                        let after = v.succ();
                        // SAFETY: Both chain edges are locked.
                        unsafe { &*after }.set_pred(pred);
                        p.set_succ(after);
                        // SAFETY: Locked above.
                        unsafe {
                            v.unlock_succ();
                            p.unlock_succ();
                        }

                        self.remove_from_tree(victim, relocated, victim_parent);

                        let local = self.stats.local();
                        local.real_nodes_deleted.fetch_add(1, STAT_ORD);
                        local.struct_mods.fetch_add(1, STAT_ORD);

                        // SAFETY: Released once after the grace period.
                        unsafe { guard.defer_retire(value, reclaim_value::<V>) };
                        // SAFETY: The node is out of both structures.
                        unsafe { guard.defer_retire(victim, reclaim_node::<K, V>) };
                        return Some(previous);
                    }
                }
            }

            // SAFETY: Locked above.
            unsafe { p.unlock_succ() };
            trace_log!("remove restart: chain interval moved");
        }
    }

    /// Tree-lock the victim and, when it has two children, its in-order
    /// successor, the successor's parent, and the successor's right
    /// child, in that order, with try-lock-and-yield on conflicts.
    ///
    /// Returns the successor when the victim has two children.
    fn acquire_tree_locks(&self, victim: *mut Node<K, V>) -> Option<*mut Node<K, V>> {
        loop {
            // SAFETY: The victim is pinned by its chain locks.
            let n = unsafe { &*victim };
            n.lock_tree();

            let right = n.right();
            let left = n.left();
            if right.is_null() || left.is_null() {
                return None;
            }

            // Two children: the in-order successor is the chain succ.
            let successor = n.succ();
            // SAFETY: The victim's succ edge is locked by the caller.
            let s = unsafe { &*successor };

            let parent = s.parent();
            if parent != victim {
                // SAFETY: Tree parents of live nodes stay valid under
                // the operation's guard.
                let par = unsafe { &*parent };
                if !par.try_lock_tree() {
                    self.stats.local().failed_lock_acquire.fetch_add(1, STAT_ORD);
                    // SAFETY: Locked at loop entry.
                    unsafe { n.unlock_tree() };
                    std::thread::yield_now();
                    continue;
                }
                if parent != s.parent() || !par.valid() {
                    // SAFETY: Both locked above.
                    unsafe {
                        par.unlock_tree();
                        n.unlock_tree();
                    }
                    std::thread::yield_now();
                    continue;
                }
            }

            if !s.try_lock_tree() {
                self.stats.local().failed_lock_acquire.fetch_add(1, STAT_ORD);
                // SAFETY: Locked above.
                unsafe { n.unlock_tree() };
                if parent != victim {
                    // SAFETY: Locked above.
                    unsafe { (*parent).unlock_tree() };
                }
                std::thread::yield_now();
                continue;
            }

            // The successor has no left child; its right child (if any)
            // is re-parented during the relocation, so lock it too.
            let succ_right = s.right();
            if !succ_right.is_null() {
                // SAFETY: s's tree lock pins its child link.
                let sr = unsafe { &*succ_right };
                if !sr.try_lock_tree() {
                    self.stats.local().failed_lock_acquire.fetch_add(1, STAT_ORD);
                    // SAFETY: All locked above.
                    unsafe {
                        n.unlock_tree();
                        s.unlock_tree();
                    }
                    if parent != victim {
                        // SAFETY: Locked above.
                        unsafe { (*parent).unlock_tree() };
                    }
                    std::thread::yield_now();
                    continue;
                }
            }

            return Some(successor);
        }
    }

    /// Tree-lock the victim's parent, restarting while the link or the
    /// parent's validity wobbles.
    fn lock_tree_parent(&self, node: *mut Node<K, V>) -> *mut Node<K, V> {
        // SAFETY: node is pinned by its chain locks.
        let n = unsafe { &*node };
        let mut parent = n.parent();
        // SAFETY: Tree parents of live nodes stay valid under the guard.
        unsafe { &*parent }.lock_tree();

        loop {
            // SAFETY: As above.
            let par = unsafe { &*parent };
            if n.parent() == parent && par.valid() {
                return parent;
            }
            // SAFETY: Locked above or in the previous iteration.
            unsafe { par.unlock_tree() };

            parent = n.parent();
            // SAFETY: As above.
            while !unsafe { &*parent }.valid() {
                std::thread::yield_now();
                parent = n.parent();
            }
            // SAFETY: As above.
            unsafe { &*parent }.lock_tree();
        }
    }

    /// Detach the victim from the tree. With two children the in-order
    /// successor node itself is relocated into the victim's position.
    /// Consumes all tree locks taken by `acquire_tree_locks` and
    /// `lock_tree_parent`.
    fn remove_from_tree(
        &self,
        victim: *mut Node<K, V>,
        relocated: Option<*mut Node<K, V>>,
        parent: *mut Node<K, V>,
    ) {
        // SAFETY: All named nodes are tree-locked by the caller.
        let n = unsafe { &*victim };

        let Some(successor) = relocated else {
            let right = n.right();
            let child = if right.is_null() { n.left() } else { right };
            update_child(parent, victim, child);
            // SAFETY: Locked by the caller.
            unsafe {
                n.unlock_tree();
                (*parent).unlock_tree();
            }
            return;
        };

        // SAFETY: Locked by the caller.
        let s = unsafe { &*successor };
        let mut old_parent = s.parent();
        let old_right = s.right();
        update_child(old_parent, successor, old_right);
        if !old_right.is_null() {
            // SAFETY: Locked by acquire_tree_locks.
            unsafe { (*old_right).unlock_tree() };
        }

        let left = n.left();
        let right = n.right();
        s.set_parent(parent);
        s.set_left(left);
        s.set_right(right);
        // SAFETY: left is non-null (victim had two children); its parent
        // link write is covered by the victim's tree lock.
        unsafe { &*left }.set_parent(successor);
        if !right.is_null() {
            // SAFETY: As above.
            unsafe { &*right }.set_parent(successor);
        }
        // SAFETY: parent is locked by the caller.
        let p = unsafe { &*parent };
        if p.left() == victim {
            p.set_left(successor);
        } else {
            p.set_right(successor);
        }

        let successor_was_direct_child = old_parent == victim;
        if successor_was_direct_child {
            old_parent = successor;
        } else {
            // SAFETY: Locked by acquire_tree_locks.
            unsafe { s.unlock_tree() };
        }
        // SAFETY: All locked by the caller.
        unsafe {
            n.unlock_tree();
            p.unlock_tree();
            (*old_parent).unlock_tree();
        }
    }

    // ========================================================================
    //  Splay
    // ========================================================================

    fn rotate_prob(&self, depth: u64, iterations: u64) -> f64 {
        let thread_num = f64::from(self.config.thread_num);
        if iterations == 0 {
            if depth > self.config.max_depth {
                1.0 / (1024.0 * thread_num)
            } else {
                1.0 / (1024.0 * 1024.0 * thread_num)
            }
        } else if depth == self.config.max_depth || depth + 1 == self.config.max_depth {
            0.0
        } else {
            1.0
        }
    }

    fn try_lock_tree_parent(
        &self,
        node: *mut Node<K, V>,
        conflicts: &mut u64,
    ) -> Option<*mut Node<K, V>> {
        for _ in 0..self.config.spin_count {
            if *conflicts >= u64::from(self.config.conflicts) {
                return None;
            }
            // SAFETY: node is tree-locked by the caller; parents of live
            // nodes stay valid under the guard.
            let parent = unsafe { &*node }.parent();
            let p = unsafe { &*parent };

            if p.try_lock_tree() {
                // SAFETY: node valid as above.
                if unsafe { &*node }.parent() == parent && p.valid() {
                    return Some(parent);
                }
                // SAFETY: Locked two lines up.
                unsafe { p.unlock_tree() };
            }

            self.stats.local().failed_lock_acquire.fetch_add(1, STAT_ORD);
            *conflicts += 1;
        }
        None
    }

    fn splay(&self, node: *mut Node<K, V>, depth: u64, _guard: &LocalGuard<'_>) {
        let mut iterations: u64 = 0;
        if rand::thread_rng().gen::<f64>() >= self.rotate_prob(depth, iterations) {
            return;
        }

        let mut conflicts: u64 = 0;
        // SAFETY: node was reached by this operation under its guard.
        let n = unsafe { &*node };
        n.lock_tree();
        if !n.valid() {
            // SAFETY: Locked above.
            unsafe { n.unlock_tree() };
            return;
        }

        let Some(mut parent) = self.try_lock_tree_parent(node, &mut conflicts) else {
            // SAFETY: Locked above.
            unsafe { n.unlock_tree() };
            return;
        };

        let mut depth = depth;
        while parent != self.root {
            let Some(gparent) = self.try_lock_tree_parent(parent, &mut conflicts) else {
                break;
            };

            if gparent == self.root {
                // zig
                // SAFETY: All three locked in this walk.
                let p = unsafe { &*parent };
                self.rotate(node, parent, gparent, p.left() != node);
                // SAFETY: Locked earlier in this walk.
                unsafe { p.unlock_tree() };
                parent = gparent;
                break;
            }

            let Some(ggparent) = self.try_lock_tree_parent(gparent, &mut conflicts) else {
                // SAFETY: Locked above.
                unsafe { (*gparent).unlock_tree() };
                break;
            };

            // SAFETY: All four locked in this walk.
            let p = unsafe { &*parent };
            let g = unsafe { &*gparent };
            if (p.left() == node) == (g.left() == parent) {
                // zig-zig
                self.rotate(parent, gparent, ggparent, g.left() != parent);
                self.rotate(node, parent, ggparent, p.left() != node);
            } else {
                // zig-zag
                self.rotate(node, parent, gparent, p.left() != node);
                self.rotate(node, gparent, ggparent, g.left() != node);
            }
            depth = depth.saturating_sub(2);
            iterations += 1;
            // SAFETY: Locked earlier in this walk.
            unsafe {
                p.unlock_tree();
                g.unlock_tree();
            }
            parent = ggparent;

            if rand::thread_rng().gen::<f64>() >= self.rotate_prob(depth, iterations) {
                break;
            }
        }

        // SAFETY: parent is the last ancestor still locked; node locked
        // at entry.
        unsafe {
            (*parent).unlock_tree();
            n.unlock_tree();
        }
    }

    /// In-place single rotation raising `child` over `node`; `parent` is
    /// the splice target. All three are tree-locked.
    fn rotate(&self, child: *mut Node<K, V>, node: *mut Node<K, V>, parent: *mut Node<K, V>, left: bool) {
        self.stats.local().struct_mods.fetch_add(1, STAT_ORD);

        // SAFETY: All locked by the caller.
        let p = unsafe { &*parent };
        let n = unsafe { &*node };
        let c = unsafe { &*child };

        if p.left() == node {
            p.set_left(child);
        } else {
            p.set_right(child);
        }
        c.set_parent(parent);
        n.set_parent(child);

        let grand_child = if left { c.left() } else { c.right() };
        if left {
            n.set_right(grand_child);
            if !grand_child.is_null() {
                // SAFETY: grand_child's old parent (child) is locked.
                unsafe { &*grand_child }.set_parent(node);
            }
            c.set_left(node);
        } else {
            n.set_left(grand_child);
            if !grand_child.is_null() {
                // SAFETY: As above.
                unsafe { &*grand_child }.set_parent(node);
            }
            c.set_right(node);
        }
    }

    // ========================================================================
    //  Extra map surface
    // ========================================================================

    /// Unconditional insert-or-replace; returns the previous value.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.insert_impl(&key, InsertMode::Put, Arc::new(value), &guard)
    }

    /// Replace only if a live mapping exists; returns the previous value.
    pub fn replace(&self, key: &K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.insert_impl(key, InsertMode::Replace, Arc::new(value), &guard)
    }

    /// Weakly-consistent cursor over the live mappings in key order.
    pub fn iter(&self) -> LogicalIter<'_, K, V> {
        LogicalIter {
            guard: self.guard(),
            cursor: self.anchor,
        }
    }
}

/// Re-point `parent`'s edge from `old_child` to `new_child`.
fn update_child<K, V>(
    parent: *mut Node<K, V>,
    old_child: *mut Node<K, V>,
    new_child: *mut Node<K, V>,
) -> bool {
    // SAFETY: parent and old_child are tree-locked by the caller.
    let p = unsafe { &*parent };
    if !new_child.is_null() {
        // SAFETY: The edge is covered by the locks above.
        unsafe { &*new_child }.set_parent(parent);
    }
    let was_left = p.left() == old_child;
    if was_left {
        p.set_left(new_child);
    } else {
        p.set_right(new_child);
    }
    was_left
}

impl<K: Ord + Clone, V> ConcurrentMap<K, V> for LogicalOrderingMap<K, V> {
    fn get(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.guard();
        self.get_impl(key, &guard)
    }

    fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.insert_impl(&key, InsertMode::PutIfAbsent, Arc::new(value), &guard)
    }

    fn remove(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.guard();
        self.remove_impl(key, &guard)
    }

    fn len(&self) -> usize {
        let _guard = self.guard();
        let mut count = 0_usize;
        let mut stack: Vec<*mut Node<K, V>> = Vec::with_capacity(64);
        stack.push(self.root_ref().left());

        while let Some(ptr) = stack.pop() {
            if ptr.is_null() {
                continue;
            }
            // SAFETY: Reachable node under the guard above.
            let node = unsafe { &*ptr };
            if node.valid() {
                count += 1;
            }
            stack.push(node.left());
            stack.push(node.right());
        }
        count
    }

    fn is_empty(&self) -> bool {
        self.root_ref().left().is_null()
    }

    fn clear(&self) {
        let guard = self.guard();
        let anchor = self.anchor_ref();
        let root = self.root_ref();

        anchor.lock_succ();
        root.lock_tree();

        let old = root.left();
        anchor.set_succ(self.root);
        root.set_pred(self.anchor);
        root.set_left(StdPtr::null_mut());

        // SAFETY: Both locked above.
        unsafe {
            anchor.unlock_succ();
            root.unlock_tree();
        }

        if !old.is_null() {
            // SAFETY: The subtree is detached; readers that entered
            // before are covered by the grace period.
            unsafe { guard.defer_retire(old, reclaim_subtree::<K, V>) };
        }
    }
}

/// Weakly-consistent cursor walking the chain, skipping spliced-out
/// nodes, stopping at the +inf anchor.
pub struct LogicalIter<'a, K, V> {
    #[expect(dead_code, reason = "held to pin chain nodes until the cursor drops")]
    guard: LocalGuard<'a>,
    cursor: *mut Node<K, V>,
}

impl<K: Ord + Clone, V> Iterator for LogicalIter<'_, K, V> {
    type Item = (K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // SAFETY: The iterator's guard pins every node reachable
            // from the cursor.
            let mut next = unsafe { &*self.cursor }.succ();
            // Spliced-out nodes keep their outgoing links; walk through
            // them.
            // SAFETY: As above.
            while !unsafe { &*next }.valid() {
                next = unsafe { &*next }.succ();
            }
            self.cursor = next;

            // SAFETY: As above.
            let node = unsafe { &*next };
            if node.is_anchor() {
                return None;
            }
            let value = node.value_ptr();
            if value.is_null() {
                continue;
            }
            // SAFETY: Loaded from a reachable slot under the guard.
            return Some((node.clone_key(), unsafe { value_clone_raw(value) }));
        }
    }
}
