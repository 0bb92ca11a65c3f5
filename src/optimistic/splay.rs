//! Splay pass for the optimistic-version map.
//!
//! Rotations here are in place: each one brackets its pointer surgery
//! between begin/end marks on the version words of exactly the nodes
//! whose subtree key ranges change. A single rotation shrinks one node
//! and grows one; the double rotations shrink two and grow one (the
//! promoted middle node of a zig-zag counts as the grow).
//!
//! Down links that originally pointed at a shrinking node are the last
//! to change - changing them early would let a search bypass the OVL
//! that flags its own invalidity. Down links originating from shrinking
//! nodes change first, because their timing is unconstrained. Swap
//! "down" for "up" and "shrink" for "grow" for the parent links.

use rand::Rng;
use seize::LocalGuard;

use crate::ordering::STAT_ORD;

use super::node::Node;
use super::ovl::{begin_grow, begin_shrink, end_grow, is_unlinked};
use super::OptimisticSplayMap;

impl<K: Ord + Clone, V> OptimisticSplayMap<K, V> {
    /// Lock `node.parent` with bounded try-lock attempts, revalidating
    /// the link under the lock.
    fn try_lock_parent(
        &self,
        node: *mut Node<K, V>,
        conflicts: &mut u64,
    ) -> Option<*mut Node<K, V>> {
        for _ in 0..self.config.spin_count {
            if *conflicts >= u64::from(self.config.conflicts) {
                return None;
            }

            // SAFETY: node is locked by the caller; its parent pointer
            // targets a node kept alive by the guard.
            let parent = unsafe { &*node }.parent();
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

    /// Probabilistically splay `node` toward the root after an access at
    /// `depth`.
    pub(super) fn splay(&self, node: *mut Node<K, V>, depth: u64, guard: &LocalGuard<'_>) {
        let config = &self.config;

        if rand::thread_rng().gen::<f64>() >= config.splay_prob() {
            return;
        }

        let total = (self.stats.bump_splay_ops() - 1) * u64::from(config.thread_num);
        // SAFETY: node was reached by this operation's descent under the
        // caller's guard.
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

        let mut conflicts: u64 = 0;
        let Some(mut parent) = self.try_lock_parent(node, &mut conflicts) else {
            // SAFETY: Locked above.
            unsafe { n.unlock() };
            return;
        };

        let mut depth = depth;
        #[expect(clippy::cast_precision_loss, reason = "heuristic gate only")]
        while parent != self.holder
            && !is_unlinked(n.ovl())
            && (depth as f64) > config.k2 * m
            && depth > config.max_depth + 1
        {
            let Some(gparent) = self.try_lock_parent(parent, &mut conflicts) else {
                break;
            };

            if gparent == self.holder {
                self.zig(node, parent, gparent, guard);
                // SAFETY: Locked by try_lock_parent above.
                unsafe { (*gparent).unlock() };
                break;
            }

            let Some(ggparent) = self.try_lock_parent(gparent, &mut conflicts) else {
                // SAFETY: Locked by try_lock_parent above.
                unsafe { (*gparent).unlock() };
                break;
            };

            let rotated = self.splay_once(node, parent, gparent, ggparent, guard);
            // SAFETY: Locked earlier in this walk.
            unsafe {
                (*parent).unlock();
                (*gparent).unlock();
            }
            parent = ggparent;
            if !rotated {
                break;
            }
            depth = depth.saturating_sub(2);
        }

        // SAFETY: node locked at entry; parent is the last ancestor
        // still locked.
        unsafe {
            n.unlock();
            (*parent).unlock();
        }
    }

    /// Single rotation against the root holder, with tombstone cleanup.
    /// All three nodes are locked.
    fn zig(
        &self,
        node: *mut Node<K, V>,
        nparent: *mut Node<K, V>,
        ngparent: *mut Node<K, V>,
        guard: &LocalGuard<'_>,
    ) {
        // SAFETY: All locked by the caller.
        let n = unsafe { &*node };
        let nl = n.left();
        let nr = n.right();

        if (nl.is_null() || nr.is_null())
            && n.value_ptr().is_null()
            && self.attempt_unlink_locked(nparent, node, guard)
        {
            return;
        }
        let p = unsafe { &*nparent };
        if p.value_ptr().is_null()
            && (p.left().is_null() || p.right().is_null())
            && self.attempt_unlink_locked(ngparent, nparent, guard)
        {
            return;
        }

        if p.left() == node {
            self.rotate_right(ngparent, nparent, node, nr, guard);
        } else {
            self.rotate_left(ngparent, nparent, node, nl, guard);
        }
    }

    /// One zig-zig or zig-zag step raising `node` two levels, with
    /// tombstone cleanup first. All four nodes are locked. Returns false
    /// when cleanup consumed the step.
    fn splay_once(
        &self,
        node: *mut Node<K, V>,
        nparent: *mut Node<K, V>,
        ngparent: *mut Node<K, V>,
        nggparent: *mut Node<K, V>,
        guard: &LocalGuard<'_>,
    ) -> bool {
        // SAFETY: All locked by the caller.
        let n = unsafe { &*node };
        let nl = n.left();
        let nr = n.right();

        if (nl.is_null() || nr.is_null())
            && n.value_ptr().is_null()
            && self.attempt_unlink_locked(nparent, node, guard)
        {
            return false;
        }
        let p = unsafe { &*nparent };
        if p.value_ptr().is_null()
            && (p.left().is_null() || p.right().is_null())
            && self.attempt_unlink_locked(ngparent, nparent, guard)
        {
            return false;
        }
        let g = unsafe { &*ngparent };
        if g.value_ptr().is_null()
            && (g.left().is_null() || g.right().is_null())
            && self.attempt_unlink_locked(nggparent, ngparent, guard)
        {
            return false;
        }

        if g.left() == nparent && p.right() == node {
            self.zigzag_right(nggparent, ngparent, nparent, node, guard);
        } else if g.right() == nparent && p.left() == node {
            self.zigzag_left(nggparent, ngparent, nparent, node, guard);
        } else if g.left() == nparent && p.left() == node {
            self.zigzig_right(nggparent, ngparent, nparent, node, guard);
        } else if g.right() == nparent && p.right() == node {
            self.zigzig_left(nggparent, ngparent, nparent, node, guard);
        }
        true
    }

    // ========================================================================
    //  Rotations (in place, OVL bracketed)
    // ========================================================================

    /// Rotate `n` right: its left child `nl` is promoted. `n` shrinks,
    /// `nl` grows. Caller holds locks on all named nodes.
    fn rotate_right(
        &self,
        nparent: *mut Node<K, V>,
        n: *mut Node<K, V>,
        nl: *mut Node<K, V>,
        nlr: *mut Node<K, V>,
        _guard: &LocalGuard<'_>,
    ) {
        // SAFETY: All locked by the caller.
        let parent = unsafe { &*nparent };
        let node = unsafe { &*n };
        let left = unsafe { &*nl };

        let node_ovl = node.ovl();
        let left_ovl = left.ovl();

        self.stats.local().struct_mods.fetch_add(1, STAT_ORD);

        let n_pl = parent.left();

        node.set_ovl(begin_shrink(node_ovl));
        left.set_ovl(begin_grow(left_ovl));

        node.set_left(nlr);
        left.set_right(n);
        if n_pl == n {
            parent.set_left(nl);
        } else {
            parent.set_right(nl);
        }

        left.set_parent(nparent);
        node.set_parent(nl);
        if !nlr.is_null() {
            // SAFETY: nlr's old parent (node) is locked.
            unsafe { &*nlr }.set_parent(n);
        }

        left.set_ovl(end_grow(left_ovl));
        node.set_ovl(self.masks.end_shrink(node_ovl));
    }

    /// Mirror image of [`Self::rotate_right`].
    fn rotate_left(
        &self,
        nparent: *mut Node<K, V>,
        n: *mut Node<K, V>,
        nr: *mut Node<K, V>,
        nrl: *mut Node<K, V>,
        _guard: &LocalGuard<'_>,
    ) {
        // SAFETY: All locked by the caller.
        let parent = unsafe { &*nparent };
        let node = unsafe { &*n };
        let right = unsafe { &*nr };

        let node_ovl = node.ovl();
        let right_ovl = right.ovl();

        self.stats.local().struct_mods.fetch_add(1, STAT_ORD);

        let n_pl = parent.left();

        node.set_ovl(begin_shrink(node_ovl));
        right.set_ovl(begin_grow(right_ovl));

        node.set_right(nrl);
        right.set_left(n);
        if n_pl == n {
            parent.set_left(nr);
        } else {
            parent.set_right(nr);
        }

        right.set_parent(nparent);
        node.set_parent(nr);
        if !nrl.is_null() {
            // SAFETY: nrl's old parent (node) is locked.
            unsafe { &*nrl }.set_parent(n);
        }

        right.set_ovl(end_grow(right_ovl));
        node.set_ovl(self.masks.end_shrink(node_ovl));
    }

    /// Zig-zag promoting `nlr` over `nl` and `n` (n shrinks, nl shrinks,
    /// nlr grows).
    fn zigzag_right(
        &self,
        nparent: *mut Node<K, V>,
        n: *mut Node<K, V>,
        nl: *mut Node<K, V>,
        nlr: *mut Node<K, V>,
        _guard: &LocalGuard<'_>,
    ) {
        // SAFETY: All locked by the caller.
        let parent = unsafe { &*nparent };
        let node = unsafe { &*n };
        let left = unsafe { &*nl };
        let middle = unsafe { &*nlr };

        let node_ovl = node.ovl();
        let left_ovl = left.ovl();
        let middle_ovl = middle.ovl();

        let n_pl = parent.left();
        let nlrl = middle.left();
        let nlrr = middle.right();

        self.stats.local().struct_mods.fetch_add(1, STAT_ORD);

        node.set_ovl(begin_shrink(node_ovl));
        left.set_ovl(begin_shrink(left_ovl));
        middle.set_ovl(begin_grow(middle_ovl));

        node.set_left(nlrr);
        left.set_right(nlrl);
        middle.set_left(nl);
        middle.set_right(n);
        if n_pl == n {
            parent.set_left(nlr);
        } else {
            parent.set_right(nlr);
        }

        middle.set_parent(nparent);
        left.set_parent(nlr);
        node.set_parent(nlr);
        if !nlrr.is_null() {
            // SAFETY: nlrr's old parent (middle) is locked.
            unsafe { &*nlrr }.set_parent(n);
        }
        if !nlrl.is_null() {
            // SAFETY: nlrl's old parent (middle) is locked.
            unsafe { &*nlrl }.set_parent(nl);
        }

        middle.set_ovl(end_grow(middle_ovl));
        left.set_ovl(self.masks.end_shrink(left_ovl));
        node.set_ovl(self.masks.end_shrink(node_ovl));
    }

    /// Mirror image of [`Self::zigzag_right`].
    fn zigzag_left(
        &self,
        nparent: *mut Node<K, V>,
        n: *mut Node<K, V>,
        nr: *mut Node<K, V>,
        nrl: *mut Node<K, V>,
        _guard: &LocalGuard<'_>,
    ) {
        // SAFETY: All locked by the caller.
        let parent = unsafe { &*nparent };
        let node = unsafe { &*n };
        let right = unsafe { &*nr };
        let middle = unsafe { &*nrl };

        let node_ovl = node.ovl();
        let right_ovl = right.ovl();
        let middle_ovl = middle.ovl();

        let n_pl = parent.left();
        let nrll = middle.left();
        let nrlr = middle.right();

        self.stats.local().struct_mods.fetch_add(1, STAT_ORD);

        node.set_ovl(begin_shrink(node_ovl));
        right.set_ovl(begin_shrink(right_ovl));
        middle.set_ovl(begin_grow(middle_ovl));

        node.set_right(nrll);
        right.set_left(nrlr);
        middle.set_right(nr);
        middle.set_left(n);
        if n_pl == n {
            parent.set_left(nrl);
        } else {
            parent.set_right(nrl);
        }

        middle.set_parent(nparent);
        right.set_parent(nrl);
        node.set_parent(nrl);
        if !nrll.is_null() {
            // SAFETY: nrll's old parent (middle) is locked.
            unsafe { &*nrll }.set_parent(n);
        }
        if !nrlr.is_null() {
            // SAFETY: nrlr's old parent (middle) is locked.
            unsafe { &*nrlr }.set_parent(nr);
        }

        middle.set_ovl(end_grow(middle_ovl));
        right.set_ovl(self.masks.end_shrink(right_ovl));
        node.set_ovl(self.masks.end_shrink(node_ovl));
    }

    /// Zig-zig promoting `nll` over `nl` and `n` (two same-direction
    /// right rotations' worth of surgery in one bracket).
    fn zigzig_right(
        &self,
        nparent: *mut Node<K, V>,
        n: *mut Node<K, V>,
        nl: *mut Node<K, V>,
        nll: *mut Node<K, V>,
        _guard: &LocalGuard<'_>,
    ) {
        // SAFETY: All locked by the caller.
        let parent = unsafe { &*nparent };
        let node = unsafe { &*n };
        let left = unsafe { &*nl };
        let bottom = unsafe { &*nll };

        let node_ovl = node.ovl();
        let left_ovl = left.ovl();
        let bottom_ovl = bottom.ovl();

        let n_pl = parent.left();
        let nlr = left.right();
        let nllr = bottom.right();

        self.stats.local().struct_mods.fetch_add(1, STAT_ORD);

        node.set_ovl(begin_shrink(node_ovl));
        left.set_ovl(begin_shrink(left_ovl));
        bottom.set_ovl(begin_grow(bottom_ovl));

        left.set_right(n);
        left.set_left(nllr);
        bottom.set_right(nl);

        node.set_left(nlr);

        if n_pl == n {
            parent.set_left(nll);
        } else {
            parent.set_right(nll);
        }

        bottom.set_parent(nparent);
        left.set_parent(nll);
        node.set_parent(nl);
        if !nllr.is_null() {
            // SAFETY: nllr's old parent (bottom) is locked.
            unsafe { &*nllr }.set_parent(nl);
        }
        if !nlr.is_null() {
            // SAFETY: nlr's old parent (left) is locked.
            unsafe { &*nlr }.set_parent(n);
        }

        bottom.set_ovl(end_grow(bottom_ovl));
        left.set_ovl(self.masks.end_shrink(left_ovl));
        node.set_ovl(self.masks.end_shrink(node_ovl));
    }

    /// Mirror image of [`Self::zigzig_right`].
    fn zigzig_left(
        &self,
        nparent: *mut Node<K, V>,
        n: *mut Node<K, V>,
        nr: *mut Node<K, V>,
        nrr: *mut Node<K, V>,
        _guard: &LocalGuard<'_>,
    ) {
        // SAFETY: All locked by the caller.
        let parent = unsafe { &*nparent };
        let node = unsafe { &*n };
        let right = unsafe { &*nr };
        let bottom = unsafe { &*nrr };

        let node_ovl = node.ovl();
        let right_ovl = right.ovl();
        let bottom_ovl = bottom.ovl();

        let n_pl = parent.left();
        let nrl = right.left();
        let nrrl = bottom.left();

        self.stats.local().struct_mods.fetch_add(1, STAT_ORD);

        node.set_ovl(begin_shrink(node_ovl));
        right.set_ovl(begin_shrink(right_ovl));
        bottom.set_ovl(begin_grow(bottom_ovl));

        right.set_left(n);
        right.set_right(nrrl);
        bottom.set_left(nr);

        node.set_right(nrl);

        if n_pl == n {
            parent.set_left(nrr);
        } else {
            parent.set_right(nrr);
        }

        bottom.set_parent(nparent);
        right.set_parent(nrr);
        node.set_parent(nr);
        if !nrrl.is_null() {
            // SAFETY: nrrl's old parent (bottom) is locked.
            unsafe { &*nrrl }.set_parent(nr);
        }
        if !nrl.is_null() {
            // SAFETY: nrl's old parent (right) is locked.
            unsafe { &*nrl }.set_parent(n);
        }

        bottom.set_ovl(end_grow(bottom_ovl));
        right.set_ovl(self.masks.end_shrink(right_ovl));
        node.set_ovl(self.masks.end_shrink(node_ovl));
    }
}
