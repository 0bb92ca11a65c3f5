//! Per-thread operation statistics.
//!
//! Every map owns a [`Stats`] block: a fixed array of cache-padded
//! counter slots indexed by a dense thread id. Threads are registered on
//! first use by a process-wide id allocator; the id is cached in a
//! thread-local integer so the hot path is a single indexed `Relaxed`
//! increment with no sharing between threads.
//!
//! The counters are observability only - they carry no synchronization
//! role and no effect on map semantics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::ordering::STAT_ORD;

/// Number of counter slots per map. Thread ids wrap modulo this, so
/// counts stay correct (merely shared) beyond this many threads.
pub const STAT_SLOTS: usize = 128;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static THREAD_SLOT: usize = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed) % STAT_SLOTS;
}

/// Dense slot index for the calling thread, assigned on first use.
#[must_use]
pub fn thread_slot() -> usize {
    THREAD_SLOT.with(|id| *id)
}

/// One thread's counters.
///
/// Field set mirrors what the tree operations record: read traffic,
/// structural modifications, lock contention, and the found/not-found
/// traversal split of the logical-ordering variant.
#[derive(Debug, Default)]
pub struct ThreadCounters {
    /// Completed `get` operations.
    pub get_count: AtomicU64,
    /// Nodes visited during tree descents.
    pub nodes_traversed: AtomicU64,
    /// Rotations and unlinks performed.
    pub struct_mods: AtomicU64,
    /// try-lock attempts that failed.
    pub failed_lock_acquire: AtomicU64,
    /// Nodes physically unlinked from the tree.
    pub real_nodes_deleted: AtomicU64,
    /// Lookups that found a live key.
    pub found_cnt: AtomicU64,
    /// Tree edges walked on found lookups.
    pub found_tree_traversed: AtomicU64,
    /// Chain edges walked on found lookups.
    pub found_logical_traversed: AtomicU64,
    /// Lookups that missed.
    pub not_found_cnt: AtomicU64,
    /// Tree edges walked on missed lookups.
    pub not_found_tree_traversed: AtomicU64,
    /// Chain edges walked on missed lookups.
    pub not_found_logical_traversed: AtomicU64,
    /// Accesses counted by the splay gate; also the per-thread total the
    /// gate's log-ratio compares node counters against.
    pub splay_ops: AtomicU64,
}

macro_rules! sum_field {
    ($slots:expr, $field:ident) => {
        $slots.iter().map(|s| s.$field.load(STAT_ORD)).sum()
    };
}

/// Per-map statistics block.
#[derive(Debug)]
pub struct Stats {
    slots: Box<[CachePadded<ThreadCounters>]>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    /// Create a zeroed statistics block.
    #[must_use]
    pub fn new() -> Self {
        let slots = (0..STAT_SLOTS)
            .map(|_| CachePadded::new(ThreadCounters::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { slots }
    }

    /// The calling thread's counter slot.
    #[inline]
    #[must_use]
    pub fn local(&self) -> &ThreadCounters {
        &self.slots[thread_slot()]
    }

    /// Bump the per-thread splay access counter and return the new total.
    #[inline]
    pub(crate) fn bump_splay_ops(&self) -> u64 {
        self.local().splay_ops.fetch_add(1, STAT_ORD) + 1
    }

    /// Aggregate all slots into a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            get_count: sum_field!(self.slots, get_count),
            nodes_traversed: sum_field!(self.slots, nodes_traversed),
            struct_mods: sum_field!(self.slots, struct_mods),
            failed_lock_acquire: sum_field!(self.slots, failed_lock_acquire),
            real_nodes_deleted: sum_field!(self.slots, real_nodes_deleted),
            found_cnt: sum_field!(self.slots, found_cnt),
            found_tree_traversed: sum_field!(self.slots, found_tree_traversed),
            found_logical_traversed: sum_field!(self.slots, found_logical_traversed),
            not_found_cnt: sum_field!(self.slots, not_found_cnt),
            not_found_tree_traversed: sum_field!(self.slots, not_found_tree_traversed),
            not_found_logical_traversed: sum_field!(self.slots, not_found_logical_traversed),
        }
    }

    /// Zero every counter in every slot.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.get_count.store(0, STAT_ORD);
            slot.nodes_traversed.store(0, STAT_ORD);
            slot.struct_mods.store(0, STAT_ORD);
            slot.failed_lock_acquire.store(0, STAT_ORD);
            slot.real_nodes_deleted.store(0, STAT_ORD);
            slot.found_cnt.store(0, STAT_ORD);
            slot.found_tree_traversed.store(0, STAT_ORD);
            slot.found_logical_traversed.store(0, STAT_ORD);
            slot.not_found_cnt.store(0, STAT_ORD);
            slot.not_found_tree_traversed.store(0, STAT_ORD);
            slot.not_found_logical_traversed.store(0, STAT_ORD);
            slot.splay_ops.store(0, STAT_ORD);
        }
    }
}

/// Point-in-time aggregate of all thread slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Completed `get` operations.
    pub get_count: u64,
    /// Nodes visited during tree descents.
    pub nodes_traversed: u64,
    /// Rotations and unlinks performed.
    pub struct_mods: u64,
    /// try-lock attempts that failed.
    pub failed_lock_acquire: u64,
    /// Nodes physically unlinked from the tree.
    pub real_nodes_deleted: u64,
    /// Lookups that found a live key.
    pub found_cnt: u64,
    /// Tree edges walked on found lookups.
    pub found_tree_traversed: u64,
    /// Chain edges walked on found lookups.
    pub found_logical_traversed: u64,
    /// Lookups that missed.
    pub not_found_cnt: u64,
    /// Tree edges walked on missed lookups.
    pub not_found_tree_traversed: u64,
    /// Chain edges walked on missed lookups.
    pub not_found_logical_traversed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_slot_is_stable() {
        let stats = Stats::new();
        let a = std::ptr::from_ref(stats.local());
        let b = std::ptr::from_ref(stats.local());
        assert_eq!(a, b);
    }

    #[test]
    fn snapshot_aggregates_increments() {
        let stats = Stats::new();
        stats.local().get_count.fetch_add(3, STAT_ORD);
        stats.local().struct_mods.fetch_add(1, STAT_ORD);

        let snap = stats.snapshot();
        assert_eq!(snap.get_count, 3);
        assert_eq!(snap.struct_mods, 1);
        assert_eq!(snap.failed_lock_acquire, 0);
    }

    #[test]
    fn reset_zeroes_all_slots() {
        let stats = Stats::new();
        stats.local().nodes_traversed.fetch_add(42, STAT_ORD);
        let _ = stats.bump_splay_ops();

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn splay_ops_counts_from_one() {
        let stats = Stats::new();
        assert_eq!(stats.bump_splay_ops(), 1);
        assert_eq!(stats.bump_splay_ops(), 2);
    }

    #[test]
    fn slots_from_other_threads_aggregate() {
        let stats = std::sync::Arc::new(Stats::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = std::sync::Arc::clone(&stats);
                std::thread::spawn(move || {
                    stats.local().get_count.fetch_add(10, STAT_ORD);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.snapshot().get_count, 40);
    }
}
