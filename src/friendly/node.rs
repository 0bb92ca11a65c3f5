//! Node model for the contention-friendly tree variants.
//!
//! A node owns its key, a raw-pointer value slot (null = tombstone), and
//! atomic links to its children and parent. Structural fields may only be
//! written while the node's lock is held; readers take no locks and rely
//! on the `removed` flag plus retries to detect concurrent restructuring.
//!
//! The root holder is an ordinary node with no key. Its `cmp_key` result
//! routes every descent into its left subtree, which removes the
//! "rotation at the root" special case: the holder is always the parent
//! of any root-level rotation.

use std::ptr as StdPtr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64};

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as RawMutexApi;

use crate::ordering::{LOCKED_ORD, READ_ORD, STAT_ORD, WRITE_ORD};

/// A tree node shared by the AVL and splay variants.
///
/// `height` is maintained only by the AVL rebalance machine; `counter`
/// only by the splay gate. Sharing one layout buys both variants the
/// same search and mutation engines.
pub(crate) struct Node<K, V> {
    /// `None` only on the root holder.
    key: Option<K>,

    /// Owning `Arc` pointer, null when the key is logically deleted.
    /// The slot's strong reference moves with the node's live identity:
    /// rotations transfer it to the replacement node, removal retires it.
    value: AtomicPtr<V>,

    left: AtomicPtr<Node<K, V>>,
    right: AtomicPtr<Node<K, V>>,
    parent: AtomicPtr<Node<K, V>>,

    /// Protects the structural fields and the value slot for writers.
    lock: RawMutex,

    /// Set (under locks) when the node has been physically unlinked or
    /// rotated out. Terminal.
    removed: AtomicBool,

    /// AVL height snapshot; 1 for a fresh leaf.
    height: AtomicI32,

    /// Splay access counter.
    counter: AtomicU64,
}

impl<K, V> Node<K, V> {
    /// Root holder sentinel.
    pub(crate) fn holder() -> Self {
        Self {
            key: None,
            value: AtomicPtr::new(StdPtr::null_mut()),
            left: AtomicPtr::new(StdPtr::null_mut()),
            right: AtomicPtr::new(StdPtr::null_mut()),
            parent: AtomicPtr::new(StdPtr::null_mut()),
            lock: RawMutex::INIT,
            removed: AtomicBool::new(false),
            height: AtomicI32::new(0),
            counter: AtomicU64::new(0),
        }
    }

    /// Fresh leaf holding `value_ptr`'s strong reference.
    pub(crate) fn leaf(key: K, value_ptr: *mut V) -> Self {
        Self {
            key: Some(key),
            value: AtomicPtr::new(value_ptr),
            left: AtomicPtr::new(StdPtr::null_mut()),
            right: AtomicPtr::new(StdPtr::null_mut()),
            parent: AtomicPtr::new(StdPtr::null_mut()),
            lock: RawMutex::INIT,
            removed: AtomicBool::new(false),
            height: AtomicI32::new(1),
            counter: AtomicU64::new(0),
        }
    }

    /// Replacement for a rotated-out pivot. Takes over the pivot's value
    /// reference; the caller marks the pivot `removed` and retires it.
    pub(crate) fn rotated(
        key: K,
        height: i32,
        value_ptr: *mut V,
        left: *mut Node<K, V>,
        right: *mut Node<K, V>,
        parent: *mut Node<K, V>,
    ) -> Self {
        Self {
            key: Some(key),
            value: AtomicPtr::new(value_ptr),
            left: AtomicPtr::new(left),
            right: AtomicPtr::new(right),
            parent: AtomicPtr::new(parent),
            lock: RawMutex::INIT,
            removed: AtomicBool::new(false),
            height: AtomicI32::new(height),
            counter: AtomicU64::new(0),
        }
    }

    // ========================================================================
    //  Key
    // ========================================================================

    /// Ordering of `key` relative to this node. The holder's missing key
    /// reports `Less`, routing every search into its left subtree.
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

    /// The user key. Must not be called on the root holder.
    #[inline]
    pub(crate) fn user_key(&self) -> &K {
        debug_assert!(self.key.is_some(), "user_key on the root holder");
        self.key.as_ref().unwrap()
    }

    /// Clone the user key for a replacement node.
    #[inline]
    pub(crate) fn clone_key(&self) -> K
    where
        K: Clone,
    {
        self.user_key().clone()
    }

    // ========================================================================
    //  Links
    // ========================================================================

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
    //  Lock and flags
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

    #[inline]
    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(READ_ORD)
    }

    /// Mark the node rotated out or unlinked. Caller holds the lock.
    #[inline]
    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, WRITE_ORD);
    }

    // ========================================================================
    //  Per-variant balance data
    // ========================================================================

    #[inline]
    pub(crate) fn height(&self) -> i32 {
        self.height.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn set_height(&self, height: i32) {
        self.height.store(height, WRITE_ORD);
    }

    /// Bump the splay access counter, returning the new count.
    #[inline]
    pub(crate) fn bump_counter(&self) -> u64 {
        self.counter.fetch_add(1, STAT_ORD) + 1
    }
}

/// Height of a possibly-null subtree root.
#[inline]
pub(crate) fn height_of<K, V>(node: *mut Node<K, V>) -> i32 {
    if node.is_null() {
        0
    } else {
        // SAFETY: Non-null node pointers handed around the tree are valid
        // until retired, and the caller operates under a seize guard.
        unsafe { (*node).height() }
    }
}

/// Value snapshot inside a locked region.
#[inline]
pub(crate) fn locked_value_ptr<K, V>(node: &Node<K, V>) -> *mut V {
    node.value.load(LOCKED_ORD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn holder_compares_below_every_key() {
        let holder: Node<i64, u64> = Node::holder();
        assert_eq!(holder.cmp_key(&i64::MIN), Ordering::Less);
        assert_eq!(holder.cmp_key(&0), Ordering::Less);
        assert_eq!(holder.cmp_key(&i64::MAX), Ordering::Less);
    }

    #[test]
    fn leaf_starts_live_at_height_one() {
        let value = std::sync::Arc::new(9_u64);
        let ptr = crate::value::value_into_raw(value);
        let leaf: Node<i64, u64> = Node::leaf(5, ptr);

        assert_eq!(leaf.cmp_key(&5), Ordering::Equal);
        assert_eq!(leaf.cmp_key(&4), Ordering::Less);
        assert_eq!(leaf.cmp_key(&6), Ordering::Greater);
        assert_eq!(leaf.height(), 1);
        assert!(!leaf.is_removed());
        assert!(leaf.left().is_null() && leaf.right().is_null());

        // SAFETY: reclaim the slot reference created above.
        drop(unsafe { crate::value::value_from_raw(leaf.value_ptr()) });
    }

    #[test]
    fn lock_round_trip() {
        let holder: Node<i64, u64> = Node::holder();
        assert!(holder.try_lock());
        assert!(!holder.try_lock());
        // SAFETY: Locked just above.
        unsafe { holder.unlock() };
        assert!(holder.try_lock());
        // SAFETY: Locked just above.
        unsafe { holder.unlock() };
    }

    #[test]
    fn counter_bumps_monotonically() {
        let holder: Node<i64, u64> = Node::holder();
        assert_eq!(holder.bump_counter(), 1);
        assert_eq!(holder.bump_counter(), 2);
    }
}
