//! A lock-free, concurrent, resizable hash map keyed by machine-word
//! integers, built on the split-ordered lists technique of Shalev &
//! Shavit.
//!
//! The map never blocks a reader or writer: every mutating operation is
//! lock-free, and the table grows transparently as load rises. This is
//! achieved by keeping every entry — across every table size the map has
//! ever had — in one global sorted linked list (the "split order"), and
//! mapping bucket indices to positions in that list through a lazily
//! materialized tree of atomic cells (the "access trie"). Growing the
//! table only changes which anchor point a key resolves to in the list;
//! the list itself is never reorganized or rehashed.
//!
//! ```
//! use split_ordered_map::SplitOrderedMap;
//!
//! let map: SplitOrderedMap<&'static str> = SplitOrderedMap::new();
//! let guard = crossbeam_epoch::pin();
//! map.add(1, "hello", &guard);
//! assert_eq!(map.find(1, &guard), Some(&"hello"));
//! ```
//!
//! See `DESIGN.md` in the repository root for the grounding of each
//! module and the reasoning behind open-question decisions.

mod access_trie;
mod backoff;
mod error;
mod key;
mod list;
mod map;

pub use backoff::Backoff;
pub use error::MapConfigError;
pub use key::{IdentityHash, KeyHasher};
pub use map::SplitOrderedMap;
