//! Standard memory orderings for concurrent node access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading node links and value slots during optimistic
/// traversal. Pairs with writers' Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for writing node links and value slots under lock.
/// Pairs with readers' Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for reads inside a locked region.
/// Safe because the node lock provides synchronization.
pub const LOCKED_ORD: Ordering = Ordering::Relaxed;

/// Ordering for statistics counter bumps.
/// The counters carry no synchronization role.
pub const STAT_ORD: Ordering = Ordering::Relaxed;

/// Ordering for reading a version word during optimistic validation.
/// Must observe the lock-bit stores of in-flight shrinks.
pub const VERSION_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing a version word change.
/// Must be visible to waiting readers.
pub const VERSION_PUB_ORD: Ordering = Ordering::Release;
