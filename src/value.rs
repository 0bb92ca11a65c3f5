//! Value-slot encoding shared by all tree variants.
//!
//! A node's value slot is an `AtomicPtr<V>` holding a raw pointer
//! obtained from `Arc::into_raw`. The null pointer is the TOMBSTONE: the
//! key is logically absent while the node may remain as a routing node.
//!
//! Readers clone the `Arc` through the raw pointer while holding a seize
//! guard; the guard guarantees the final strong reference (dropped by a
//! deferred reclaimer after `remove`) has not been released yet, so the
//! refcount is still at least one when the increment lands.

use std::sync::Arc;

use seize::Collector;

/// Move an `Arc` into its raw-pointer slot representation.
#[inline]
#[must_use]
pub(crate) fn value_into_raw<V>(value: Arc<V>) -> *mut V {
    Arc::into_raw(value).cast_mut()
}

/// Clone the `Arc` behind a non-null value pointer.
///
/// # Safety
///
/// - `ptr` must have come from [`value_into_raw`].
/// - The caller must hold a seize guard entered before `ptr` was loaded
///   from a reachable slot, so the value's deferred release (if any)
///   has not run.
#[inline]
pub(crate) unsafe fn value_clone_raw<V>(ptr: *const V) -> Arc<V> {
    // SAFETY: Caller guarantees the refcount is still nonzero.
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

/// Take back ownership of the slot's strong reference.
///
/// # Safety
///
/// - `ptr` must have come from [`value_into_raw`] and the caller must be
///   the party retiring the slot's owning reference (exactly once).
#[inline]
pub(crate) unsafe fn value_from_raw<V>(ptr: *mut V) -> Arc<V> {
    // SAFETY: Caller transfers the slot's strong reference to us.
    unsafe { Arc::from_raw(ptr) }
}

/// Seize reclaimer releasing a removed value's owning reference.
///
/// # Safety
///
/// - `ptr` must have come from [`value_into_raw`] and been retired
///   exactly once after being swapped out of its slot.
pub(crate) unsafe fn reclaim_value<V>(ptr: *mut V, _collector: &Collector) {
    // SAFETY: Seize ran the grace period; no reader can still be about
    // to increment through this pointer.
    unsafe { drop(Arc::from_raw(ptr)) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        let value = Arc::new(7_u64);
        let ptr = value_into_raw(value);

        // SAFETY: ptr is live and owned by this test.
        let clone = unsafe { value_clone_raw(ptr) };
        assert_eq!(*clone, 7);

        // SAFETY: reclaim the slot's own reference.
        let owned = unsafe { value_from_raw(ptr) };
        assert_eq!(Arc::strong_count(&owned), 2);
    }

    #[test]
    fn reclaimer_releases_last_reference() {
        let value = Arc::new(String::from("v"));
        let weak = Arc::downgrade(&value);
        let ptr = value_into_raw(value);

        let collector = Collector::new();
        // SAFETY: ptr holds the only strong reference.
        unsafe { reclaim_value(ptr, &collector) };

        assert!(weak.upgrade().is_none());
    }
}
