//! # cftree
//!
//! Concurrent ordered maps built as internal binary search trees with
//! fine-grained locking and relaxed-balance self-adjustment.
//!
//! Four variants share one abstract design - lock-free descents,
//! validate-then-lock mutations, logical deletion split from physical
//! unlink - and differ in how they keep the tree shallow:
//!
//! - [`FriendlyAvlMap`]: relaxed AVL, maintenance walks piggybacked on
//!   mutating threads, clone-on-rotate for reader safety.
//! - [`FriendlySplayMap`]: same node model, probabilistic splaying of
//!   accessed nodes with bounded try-lock budgets.
//! - [`OptimisticSplayMap`]: no read locks at all; per-node version
//!   words validated hand over hand, in-place rotations bracketed by
//!   grow/shrink marks.
//! - [`LogicalOrderingMap`]: presence defined by a doubly-linked key
//!   chain; the tree is only a search accelerator.
//!
//! ## Guarantees
//!
//! Each `get` / `put_if_absent` / `remove` is linearizable at a single
//! point (the value read, the value splice, or the tombstone write).
//! Size and iteration are weakly consistent. Rotations and unlinks are
//! invisible to callers beyond preserving search-tree order.
//!
//! ## Memory
//!
//! Readers hold no locks, so unlinked nodes cannot be freed eagerly.
//! Every map owns a [`seize`] collector; operations run under a guard
//! and retired nodes are reclaimed after the grace period.
//!
//! ## Example
//!
//! ```
//! use cftree::{ConcurrentMap, FriendlyAvlMap};
//!
//! let map: FriendlyAvlMap<u64, &str> = FriendlyAvlMap::new();
//! assert!(map.put_if_absent(1, "one").is_none());
//! assert_eq!(map.get(&1).as_deref(), Some(&"one"));
//! assert_eq!(map.remove(&1).as_deref(), Some(&"one"));
//! assert!(map.get(&1).is_none());
//! ```

pub mod config;
pub mod map;
pub mod stats;

mod friendly;
mod logical;
mod optimistic;
mod ordering;
mod tracing_helpers;
mod value;

pub use config::{ConfigError, TreeConfig};
pub use friendly::{FriendlyAvlMap, FriendlyIter, FriendlySplayMap};
pub use logical::{LogicalIter, LogicalOrderingMap};
pub use map::ConcurrentMap;
pub use optimistic::{OptimisticIter, OptimisticSplayMap};
pub use stats::{Stats, StatsSnapshot};
