//! Node model for the logical-ordering map.
//!
//! Every node sits in two structures at once: the binary search tree
//! (`parent`/`left`/`right`, guarded by `tree_lock`) and the
//! doubly-linked key-order chain (`pred`/`succ`, guarded per edge by the
//! predecessor's `succ_lock`). The chain is the source of truth for
//! presence; the tree is only a search accelerator.

use std::ptr as StdPtr;
use std::sync::atomic::{AtomicBool, AtomicPtr};

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as RawMutexApi;

use crate::ordering::{READ_ORD, WRITE_ORD};

/// Key domain extended with the chain's anchor endpoints.
///
/// The derived ordering puts `NegInf` below every `Key` and `PosInf`
/// above, which is exactly the anchor semantics.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum AnchorKey<K> {
    NegInf,
    Key(K),
    PosInf,
}

pub(crate) struct Node<K, V> {
    key: AnchorKey<K>,

    /// Owning `Arc` pointer; null only on the anchors.
    value: AtomicPtr<V>,

    /// False once the node has been spliced out of the chain. Terminal.
    valid: AtomicBool,

    /// Chain neighbors in key order.
    pred: AtomicPtr<Node<K, V>>,
    succ: AtomicPtr<Node<K, V>>,

    /// Protects this node's `succ` and the `pred` of the node it points
    /// to (per-edge locking).
    succ_lock: RawMutex,

    /// Tree links.
    parent: AtomicPtr<Node<K, V>>,
    left: AtomicPtr<Node<K, V>>,
    right: AtomicPtr<Node<K, V>>,

    /// Protects the tree links.
    tree_lock: RawMutex,
}

impl<K, V> Node<K, V> {
    /// Anchor node (no value, valid forever).
    pub(crate) fn anchor(key: AnchorKey<K>) -> Self {
        Self {
            key,
            value: AtomicPtr::new(StdPtr::null_mut()),
            valid: AtomicBool::new(true),
            pred: AtomicPtr::new(StdPtr::null_mut()),
            succ: AtomicPtr::new(StdPtr::null_mut()),
            succ_lock: RawMutex::INIT,
            parent: AtomicPtr::new(StdPtr::null_mut()),
            left: AtomicPtr::new(StdPtr::null_mut()),
            right: AtomicPtr::new(StdPtr::null_mut()),
            tree_lock: RawMutex::INIT,
        }
    }

    /// Real node with pre-filled chain links and tree parent.
    pub(crate) fn new(
        key: K,
        value_ptr: *mut V,
        pred: *mut Node<K, V>,
        succ: *mut Node<K, V>,
        parent: *mut Node<K, V>,
    ) -> Self {
        Self {
            key: AnchorKey::Key(key),
            value: AtomicPtr::new(value_ptr),
            valid: AtomicBool::new(true),
            pred: AtomicPtr::new(pred),
            succ: AtomicPtr::new(succ),
            succ_lock: RawMutex::INIT,
            parent: AtomicPtr::new(parent),
            left: AtomicPtr::new(StdPtr::null_mut()),
            right: AtomicPtr::new(StdPtr::null_mut()),
            tree_lock: RawMutex::INIT,
        }
    }

    /// Ordering of `key` relative to this node's (possibly anchor) key.
    #[inline]
    pub(crate) fn cmp_key(&self, key: &K) -> std::cmp::Ordering
    where
        K: Ord,
    {
        match &self.key {
            AnchorKey::NegInf => std::cmp::Ordering::Greater,
            AnchorKey::Key(own) => key.cmp(own),
            AnchorKey::PosInf => std::cmp::Ordering::Less,
        }
    }

    /// Clone the user key. Must not be called on an anchor.
    #[inline]
    pub(crate) fn clone_key(&self) -> K
    where
        K: Clone,
    {
        match &self.key {
            AnchorKey::Key(own) => own.clone(),
            _ => unreachable!("clone_key on an anchor node"),
        }
    }

    #[inline]
    pub(crate) fn is_anchor(&self) -> bool {
        !matches!(self.key, AnchorKey::Key(_))
    }

    // ========================================================================
    //  Chain
    // ========================================================================

    #[inline]
    pub(crate) fn pred(&self) -> *mut Node<K, V> {
        self.pred.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn succ(&self) -> *mut Node<K, V> {
        self.succ.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn set_pred(&self, node: *mut Node<K, V>) {
        self.pred.store(node, WRITE_ORD);
    }

    #[inline]
    pub(crate) fn set_succ(&self, node: *mut Node<K, V>) {
        self.succ.store(node, WRITE_ORD);
    }

    #[inline]
    pub(crate) fn valid(&self) -> bool {
        self.valid.load(READ_ORD)
    }

    /// Splice marker; written under the chain locks of both edges.
    #[inline]
    pub(crate) fn set_invalid(&self) {
        self.valid.store(false, WRITE_ORD);
    }

    #[inline]
    pub(crate) fn lock_succ(&self) {
        self.succ_lock.lock();
    }

    /// # Safety
    ///
    /// The calling thread must hold the succ lock.
    #[inline]
    pub(crate) unsafe fn unlock_succ(&self) {
        // SAFETY: Caller holds the lock.
        unsafe { self.succ_lock.unlock() };
    }

    // ========================================================================
    //  Tree
    // ========================================================================

    #[inline]
    pub(crate) fn parent(&self) -> *mut Node<K, V> {
        self.parent.load(READ_ORD)
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
    pub(crate) fn set_parent(&self, node: *mut Node<K, V>) {
        self.parent.store(node, WRITE_ORD);
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
    pub(crate) fn lock_tree(&self) {
        self.tree_lock.lock();
    }

    #[inline]
    pub(crate) fn try_lock_tree(&self) -> bool {
        self.tree_lock.try_lock()
    }

    /// # Safety
    ///
    /// The calling thread must hold the tree lock.
    #[inline]
    pub(crate) unsafe fn unlock_tree(&self) {
        // SAFETY: Caller holds the lock.
        unsafe { self.tree_lock.unlock() };
    }

    // ========================================================================
    //  Value slot
    // ========================================================================

    #[inline]
    pub(crate) fn value_ptr(&self) -> *mut V {
        self.value.load(READ_ORD)
    }

    #[inline]
    pub(crate) fn swap_value(&self, ptr: *mut V) -> *mut V {
        self.value.swap(ptr, WRITE_ORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn anchor_ordering_brackets_all_keys() {
        let low: Node<i64, u64> = Node::anchor(AnchorKey::NegInf);
        let high: Node<i64, u64> = Node::anchor(AnchorKey::PosInf);

        assert_eq!(low.cmp_key(&i64::MIN), Ordering::Greater);
        assert_eq!(high.cmp_key(&i64::MAX), Ordering::Less);
        assert!(low.is_anchor() && high.is_anchor());
    }

    #[test]
    fn anchor_key_derive_ordering() {
        assert!(AnchorKey::NegInf < AnchorKey::Key(i64::MIN));
        assert!(AnchorKey::Key(i64::MAX) < AnchorKey::<i64>::PosInf);
        assert!(AnchorKey::Key(1) < AnchorKey::Key(2));
    }

    #[test]
    fn tree_lock_round_trip() {
        let node: Node<i64, u64> = Node::anchor(AnchorKey::NegInf);
        assert!(node.try_lock_tree());
        assert!(!node.try_lock_tree());
        // SAFETY: Locked just above.
        unsafe { node.unlock_tree() };
    }
}
