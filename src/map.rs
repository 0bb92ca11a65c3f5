//! The map interface shared by all tree variants.

use std::sync::Arc;

/// A concurrent ordered map with per-key linearizable operations.
///
/// Implementations store values as `Arc<V>`; read operations return
/// clones of the stored `Arc`. `len`, `is_empty`, and iteration are
/// weakly consistent: they observe some interleaving of concurrent
/// updates but take no global snapshot.
pub trait ConcurrentMap<K, V> {
    /// Look up `key`. Returns the value if a live mapping exists.
    fn get(&self, key: &K) -> Option<Arc<V>>;

    /// Insert `key -> value` if no live mapping exists.
    ///
    /// Returns the existing value (and leaves the map unchanged) if the
    /// key is present, or `None` after inserting.
    fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>>;

    /// Remove `key`. Returns the previous value if a live mapping
    /// existed. Physical unlink of the node may be deferred.
    fn remove(&self, key: &K) -> Option<Arc<V>>;

    /// Number of live keys. Weakly consistent.
    fn len(&self) -> usize;

    /// Whether the map holds no live keys. Weakly consistent.
    fn is_empty(&self) -> bool;

    /// Drop every mapping.
    ///
    /// Must not race with concurrent writers; concurrent readers remain
    /// safe (they observe either the old tree or the empty one).
    fn clear(&self);
}
