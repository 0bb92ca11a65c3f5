//! Node model for the optimistic-version map.
//!
//! Unlike the contention-friendly variants there is no `removed` flag:
//! the terminal `UNLINKED_OVL` word plays that role, and rotations
//! mutate nodes in place under their locks, bracketed by grow/shrink
//! marks that readers validate against.

use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU64};

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as RawMutexApi;

use crate::config::TreeConfig;
use crate::ordering::{READ_ORD, STAT_ORD, WRITE_ORD};

use super::ovl::{ChangeOvl, is_changing};

/// Descent direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Left,
    Right,
}

pub(crate) struct Node<K, V> {
    /// `None` only on the root holder.
    key: Option<K>,

    /// Owning `Arc` pointer; null means the key is logically absent.
    value: AtomicPtr<V>,

    parent: AtomicPtr<Node<K, V>>,
    change_ovl: ChangeOvl,
    left: AtomicPtr<Node<K, V>>,
    right: AtomicPtr<Node<K, V>>,

    /// Protects structural fields, the value slot, and OVL transitions.
    lock: RawMutex,

    /// Splay access counter.
    counter: AtomicU64,
}

impl<K, V> Node<K, V> {
    /// Root holder; the tree hangs off its right child.
    pub(crate) fn holder() -> Self {
        Self {
            key: None,
            value: AtomicPtr::new(StdPtr::null_mut()),
            parent: AtomicPtr::new(StdPtr::null_mut()),
            change_ovl: ChangeOvl::new(0),
            left: AtomicPtr::new(StdPtr::null_mut()),
            right: AtomicPtr::new(StdPtr::null_mut()),
            lock: RawMutex::INIT,
            counter: AtomicU64::new(0),
        }
    }

    /// Fresh leaf with a quiescent version word.
    pub(crate) fn leaf(key: K, value_ptr: *mut V, parent: *mut Node<K, V>) -> Self {
        Self {
            key: Some(key),
            value: AtomicPtr::new(value_ptr),
            parent: AtomicPtr::new(parent),
            change_ovl: ChangeOvl::new(0),
            left: AtomicPtr::new(StdPtr::null_mut()),
            right: AtomicPtr::new(StdPtr::null_mut()),
            lock: RawMutex::INIT,
            counter: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn cmp_key(&self, key: &K) -> std::cmp::Ordering
    where
        K: Ord,
    {
        match &self.key {
            None => std::cmp::Ordering::Less,
            Some(own) => key.cmp(own),
        }
    }

    /// Clone the user key. Must not be called on the root holder.
    #[inline]
    pub(crate) fn clone_key(&self) -> K
    where
        K: Clone,
    {
        debug_assert!(self.key.is_some(), "clone_key on the root holder");
        self.key.as_ref().unwrap().clone()
    }

    // ========================================================================
    //  Links
    // ========================================================================

    #[inline]
    pub(crate) fn child(&self, dir: Dir) -> *mut Node<K, V> {
        match dir {
            Dir::Left => self.left.load(READ_ORD),
            Dir::Right => self.right.load(READ_ORD),
        }
    }

    #[inline]
    pub(crate) fn set_child(&self, dir: Dir, node: *mut Node<K, V>) {
        match dir {
            Dir::Left => self.left.store(node, WRITE_ORD),
            Dir::Right => self.right.store(node, WRITE_ORD),
        }
    }

    #[inline]
    pub(crate) fn left(&self) -> *mut Node<K, V> {
        self.left.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn right(&self) -> *mut Node<K, V> {
        self.right.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn parent(&self) -> *mut Node<K, V> {
        self.parent.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn set_left(&self, node: *mut Node<K, V>) {
        self.left.store(node, WRITE_ORD);
    }

    #[inline]
    pub(crate) fn set_right(&self, node: *mut Node<K, V>) {
        self.right.store(node, WRITE_ORD);
    }

    #[inline]
    pub(crate) fn set_parent(&self, node: *mut Node<K, V>) {
        self.parent.store(node, WRITE_ORD);
    }

    // ========================================================================
    //  Value slot
    // ========================================================================

    #[inline]
    pub(crate) fn value_ptr(&self) -> *mut V {
        self.value.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn set_value(&self, ptr: *mut V) {
        self.value.store(ptr, WRITE_ORD);
    }

    #[inline]
    pub(crate) fn swap_value(&self, ptr: *mut V) -> *mut V {
        self.value.swap(ptr, WRITE_ORD)
    }

    // ========================================================================
    //  Version word
    // ========================================================================

    #[inline]
    pub(crate) fn ovl(&self) -> u64 {
        self.change_ovl.read()
    }

    /// Publish a new version word. Caller holds the node lock.
    #[inline]
    pub(crate) fn set_ovl(&self, ovl: u64) {
        self.change_ovl.write(ovl);
    }

    /// Block until an in-progress change observed as `ovl` completes.
    ///
    /// Spins, then yields, then acquires the node lock: the lock cannot
    /// be obtained while the change is still in flight, so getting it
    /// proves completion.
    pub(crate) fn wait_until_change_completed(&self, ovl: u64, config: &TreeConfig) {
        if !is_changing(ovl) {
            return;
        }

        for _ in 0..config.spin_count {
            if self.ovl() != ovl {
                return;
            }
            std::hint::spin_loop();
        }

        for _ in 0..config.yield_count {
            std::thread::yield_now();
            if self.ovl() != ovl {
                return;
            }
        }

        // Spin and yield failed; serialize behind the writer.
        self.lock.lock();
        // SAFETY: Locked on the previous line.
        unsafe { self.lock.unlock() };
        debug_assert!(self.ovl() != ovl);
    }

    // ========================================================================
    //  Lock
    // ========================================================================

    #[inline]
    pub(crate) fn lock(&self) {
        self.lock.lock();
    }

    #[inline]
    pub(crate) fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }

    /// Release the node lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock.
    #[inline]
    pub(crate) unsafe fn unlock(&self) {
        // SAFETY: Caller holds the lock.
        unsafe { self.lock.unlock() };
    }

    /// Bump the splay access counter, returning the new count.
    #[inline]
    pub(crate) fn bump_counter(&self) -> u64 {
        self.counter.fetch_add(1, STAT_ORD) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimistic::ovl::{UNLINKED_OVL, begin_shrink, is_shrinking_or_unlinked};

    #[test]
    fn leaf_word_starts_quiescent() {
        let value = std::sync::Arc::new(1_u64);
        let ptr = crate::value::value_into_raw(value);
        let leaf: Node<i64, u64> = Node::leaf(3, ptr, StdPtr::null_mut());

        assert_eq!(leaf.ovl(), 0);
        assert!(!is_shrinking_or_unlinked(leaf.ovl()));

        // SAFETY: reclaim the slot reference created above.
        drop(unsafe { crate::value::value_from_raw(leaf.value_ptr()) });
    }

    #[test]
    fn wait_returns_immediately_when_not_changing() {
        let holder: Node<i64, u64> = Node::holder();
        holder.wait_until_change_completed(0, &TreeConfig::default());
        holder.wait_until_change_completed(UNLINKED_OVL, &TreeConfig::default());
    }

    #[test]
    fn wait_observes_completed_change() {
        let holder: Node<i64, u64> = Node::holder();
        let shrinking = begin_shrink(0);
        // The node's word never held `shrinking`, so the first re-read
        // breaks the spin.
        holder.wait_until_change_completed(shrinking, &TreeConfig::default());
    }

    #[test]
    fn child_accessors_match_directions() {
        let holder: Node<i64, u64> = Node::holder();
        let child = Box::into_raw(Box::new(Node::<i64, u64>::holder()));

        holder.set_child(Dir::Right, child);
        assert_eq!(holder.right(), child);
        assert_eq!(holder.child(Dir::Right), child);
        assert!(holder.child(Dir::Left).is_null());

        // SAFETY: allocated above, never published elsewhere.
        drop(unsafe { Box::from_raw(child) });
    }
}
