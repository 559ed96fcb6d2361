//! Access trie (spec §4.4, component C3): an `NB_BUCKET`-ary tree of
//! atomic cells that lazily materializes a mapping from bucket index to
//! sentinel handle.
//!
//! Each cell starts `Uninitialized` and transitions exactly once, to
//! either `Allocated` (an internal node: a further array of cells one
//! level down) or `Initialized` (a leaf: a handle to the bucket's
//! sentinel in the list) — spec invariant 7. Which of the two a given
//! cell can become is determined purely by its depth in the tree (internal
//! levels only ever allocate, the leaf level only ever initializes), so a
//! cell is represented as a single tagged word: `0` means `Uninitialized`,
//! a pointer with its low bit clear means `Allocated` (points at a child
//! `Segment`), and a pointer with its low bit set means `Initialized`
//! (points, once the tag is masked off, at a sentinel node). Per the
//! teacher's own growable array, segments are heap-allocated on first
//! CAS-win and never freed while the trie is reachable — deleting one
//! would race against a concurrent reader descending into it, and the
//! trie is small (O(N / nb_bucket) cells) — so this module needs no
//! epoch guard of its own; only a loser's own, never-installed
//! allocation is freed immediately, since nothing else could have
//! observed it. They are freed, recursively, when the whole trie is
//! dropped (see the `Drop` impl below), matching the teacher's own
//! `GrowableArray::drop`.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::Guard;

use crate::key::{parent_bucket_index, sentinel_key};
use crate::list::{List, SentinelHandle};

const UNINITIALIZED: usize = 0;
const INITIALIZED_TAG: usize = 1;

struct AccessCell<V, const NB: usize> {
    slot: AtomicUsize,
    _marker: PhantomData<V>,
}

enum CellView<'a, V, const NB: usize> {
    Uninitialized,
    Allocated(&'a Segment<V, NB>),
    Initialized(SentinelHandle<V>),
}

impl<V, const NB: usize> AccessCell<V, NB> {
    fn uninitialized() -> Self {
        Self {
            slot: AtomicUsize::new(UNINITIALIZED),
            _marker: PhantomData,
        }
    }

    fn view(&self) -> CellView<'_, V, NB> {
        let raw = self.slot.load(Ordering::Acquire);
        if raw == UNINITIALIZED {
            CellView::Uninitialized
        } else if raw & INITIALIZED_TAG == 0 {
            // SAFETY: only `try_allocate` ever stores an untagged, non-zero
            // value here, and it always points at a live, leaked `Segment`.
            CellView::Allocated(unsafe { &*(raw as *const Segment<V, NB>) })
        } else {
            let untagged = (raw & !INITIALIZED_TAG) as *const ();
            // SAFETY: only `try_initialize` ever stores a tagged value
            // here, from a `SentinelHandle::into_raw`.
            CellView::Initialized(unsafe { SentinelHandle::from_raw(untagged) })
        }
    }

    /// `Uninitialized -> Allocated(fresh child segment)`. Idempotent: if
    /// another thread wins the race, returns the winner's child instead of
    /// ours, and our own allocation (which nobody else ever observed) is
    /// freed right away.
    fn try_allocate(&self) -> &Segment<V, NB> {
        let child = Box::into_raw(Box::new(Segment::<V, NB>::new()));
        match self.slot.compare_exchange(
            UNINITIALIZED,
            child as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*child },
            Err(_) => {
                drop(unsafe { Box::from_raw(child) });
                match self.view() {
                    CellView::Allocated(seg) => seg,
                    _ => unreachable!("a lost allocate CAS means some thread installed Allocated"),
                }
            }
        }
    }

    /// `Uninitialized -> Initialized(handle)`. Idempotent like
    /// [`Self::try_allocate`]: a lost CAS just means another thread
    /// installed an equivalent sentinel handle (spec §4.4).
    fn try_initialize(&self, handle: SentinelHandle<V>) -> SentinelHandle<V> {
        let raw = (handle.into_raw() as usize) | INITIALIZED_TAG;
        match self
            .slot
            .compare_exchange(UNINITIALIZED, raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => handle,
            Err(_) => match self.view() {
                CellView::Initialized(existing) => existing,
                _ => unreachable!("a lost initialize CAS means some thread installed Initialized"),
            },
        }
    }
}

struct Segment<V, const NB: usize> {
    cells: [AccessCell<V, NB>; NB],
}

impl<V, const NB: usize> Segment<V, NB> {
    fn new() -> Self {
        Self {
            cells: std::array::from_fn(|_| AccessCell::uninitialized()),
        }
    }
}

/// The tree-of-arrays structure (spec §3.2 `AccessTrie`). `root` is always
/// a live `Segment` (never `Uninitialized` itself — the map seeds its
/// first two slots directly at `create` time, per spec §4.6).
pub(crate) struct AccessTrie<V, const NB: usize> {
    root: AtomicUsize,
    _marker: PhantomData<V>,
}

// Every `AccessCell` holds either nothing, a `Segment` (itself made of
// `AccessCell`s), or a `SentinelHandle<V>`, all reachable only behind a
// shared `&self` — safe to share across threads under the same bound as
// the list it points into.
unsafe impl<V: Send + Sync, const NB: usize> Send for AccessTrie<V, NB> {}
unsafe impl<V: Send + Sync, const NB: usize> Sync for AccessTrie<V, NB> {}

impl<V, const NB: usize> AccessTrie<V, NB> {
    pub(crate) fn new() -> Self {
        let root = Box::into_raw(Box::new(Segment::<V, NB>::new()));
        Self {
            root: AtomicUsize::new(root as usize),
            _marker: PhantomData,
        }
    }

    fn root_segment(&self) -> &Segment<V, NB> {
        unsafe { &*(self.root.load(Ordering::Acquire) as *const Segment<V, NB>) }
    }

    /// Seeds a root slot directly with a handle, bypassing the lazy
    /// `Uninitialized -> Initialized` path — used only by
    /// [`crate::map::SplitOrderedMap::new`] to install the two sentinels
    /// it creates up front (spec §4.6).
    pub(crate) fn seed_root_slot(&self, slot: usize, handle: SentinelHandle<V>) {
        let cell = &self.root_segment().cells[slot];
        let raw = (handle.into_raw() as usize) | INITIALIZED_TAG;
        cell.slot.store(raw, Ordering::Release);
    }

    /// The physical depth of the subtree rooted at `segment`, found by
    /// walking slot 0 down through `Allocated` levels (spec §4.5
    /// `get_size_of_access`): this is deliberately a structural walk of
    /// the live tree rather than a read of a separate counter, so a
    /// helper thread can never regress an already-installed deeper trie
    /// (spec §11.2 / Design Notes). Takes `segment` rather than re-reading
    /// `self.root` so that a caller which also needs to descend from that
    /// same segment (see [`Self::get_bucket`]) derives both the depth and
    /// the walk from one consistent snapshot of the root pointer, instead
    /// of two snapshots that a concurrent `grow_to` could've installed
    /// between.
    fn depth_from(segment: &Segment<V, NB>) -> u32 {
        let mut segment = segment;
        let mut depth = 1u32;
        loop {
            match segment.cells[0].view() {
                CellView::Allocated(child) => {
                    segment = child;
                    depth += 1;
                }
                _ => return depth,
            }
        }
    }

    /// The trie's current physical depth (spec §4.5 `get_size_of_access`).
    pub(crate) fn depth(&self) -> u32 {
        Self::depth_from(self.root_segment())
    }

    pub(crate) fn access_size(&self) -> u64 {
        (NB as u64).pow(self.depth())
    }

    /// spec §4.5 `help_resize` step 1: grows the trie by repeatedly
    /// wrapping the current root under slot 0 of a fresh root, until the
    /// physical depth reaches `target_access_size`. Idempotent and safe to
    /// call from multiple concurrent helpers: the depth guard means a
    /// helper that is behind just keeps pushing levels on, and one that is
    /// already at or past `target_access_size` does nothing.
    pub(crate) fn grow_to(&self, target_access_size: u64) {
        loop {
            if self.access_size() >= target_access_size {
                return;
            }

            let old_root_raw = self.root.load(Ordering::Acquire);
            let new_root = Box::new(Segment::<V, NB>::new());
            // Install the current root under slot 0, tagged `Allocated`.
            // This preserves every sentinel handle already installed
            // anywhere under it at the same `hk` (spec invariant 3).
            new_root.cells[0].slot.store(old_root_raw, Ordering::Relaxed);
            let new_root_raw = Box::into_raw(new_root) as usize;

            match self.root.compare_exchange(
                old_root_raw,
                new_root_raw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {}
                Err(_) => {
                    // Lost the race: our `new_root` was never observed by
                    // anyone, so it's safe to free. Its slot 0 holds
                    // `old_root_raw`, which is *not* ours to free — it's
                    // still reachable (the winner's root wraps the same
                    // old root), and `Segment` has no `Drop` impl that
                    // would chase that pointer, so dropping the shell
                    // alone can't touch it.
                    drop(unsafe { Box::from_raw(new_root_raw as *mut Segment<V, NB>) });
                }
            }
        }
    }

    /// spec §4.4 `get_bucket`: returns the sentinel handle for bucket
    /// `hk`, lazily materializing trie cells (and, at the leaf, the
    /// sentinel itself in `store`) as needed.
    ///
    /// `hk` is threaded through unchanged for the leaf's parent-bucket and
    /// sentinel-key arithmetic; only a separate `residual` is divided down
    /// as the walk descends, so a deep leaf still knows its true, full
    /// bucket index rather than a level-relative remainder.
    ///
    /// The starting `level_capacity` is derived from a structural walk of
    /// the *live* root ([`Self::depth_from`]), not from the `Map`'s
    /// separately atomic `access_size` field. `help_resize` grows the
    /// real trie (`grow_to`) before it CASes `access_size` to match (spec
    /// §4.5 steps 1-2), so a caller on any other thread that read the
    /// stale, smaller `access_size` in that window would otherwise derive
    /// a `level_capacity` too small for the already-deeper live root,
    /// producing a `slot` index `>= NB` and panicking on `cells[slot]`.
    /// Reading the depth straight off the same root snapshot this call
    /// descends from rules that out (spec §11.2).
    pub(crate) fn get_bucket<'g>(
        &self,
        hk: u64,
        store: &'g List<V>,
        guard: &'g Guard,
    ) -> SentinelHandle<V> {
        let mut segment = self.root_segment();
        let depth = Self::depth_from(segment);
        let mut level_capacity = (NB as u64).pow(depth - 1);
        let mut residual = hk;

        loop {
            debug_assert!(level_capacity >= 1);
            let slot = (residual / level_capacity) as usize;
            let rest = residual % level_capacity;
            let cell = &segment.cells[slot];

            match cell.view() {
                CellView::Initialized(handle) => return handle,
                CellView::Allocated(child) => {
                    segment = child;
                    level_capacity /= NB as u64;
                    residual = rest;
                }
                CellView::Uninitialized => {
                    if level_capacity > 1 {
                        cell.try_allocate();
                        // Retry the same cell: either we just installed the
                        // child, or another thread did — either way a
                        // re-read of this slot now sees `Allocated`.
                    } else {
                        let parent_hk = parent_bucket_index(hk);
                        let parent_handle = self.get_bucket(parent_hk, store, guard);
                        let (_is_new, handle) =
                            store.sinsert_sentinel(Some(parent_handle), sentinel_key(hk), guard);
                        cell.try_initialize(handle);
                    }
                }
            }
        }
    }
}

impl<V, const NB: usize> Segment<V, NB> {
    /// Frees this segment and, recursively, every `Allocated` child
    /// reachable from it. Leaves `Initialized` handles alone — those are
    /// non-owning pointers into the list, which owns its own nodes (spec
    /// §3.4) — and `Uninitialized` cells, which never allocated anything.
    /// Matches the teacher's `GrowableArray::recursive_drop`.
    fn drop_recursive(mut self: Box<Self>) {
        for cell in self.cells.iter_mut() {
            let raw = *cell.slot.get_mut();
            if raw != UNINITIALIZED && raw & INITIALIZED_TAG == 0 {
                let child = unsafe { Box::from_raw(raw as *mut Segment<V, NB>) };
                child.drop_recursive();
            }
        }
    }
}

impl<V, const NB: usize> Drop for AccessTrie<V, NB> {
    /// Recursively frees every segment the trie ever allocated. Called
    /// only when the whole map is dropped (`&mut self` here means no
    /// other thread can hold a reference into the trie), so this needs no
    /// epoch guard, unlike the lock-free paths above.
    fn drop(&mut self) {
        let root_raw = *self.root.get_mut();
        if root_raw != UNINITIALIZED {
            let root = unsafe { Box::from_raw(root_raw as *mut Segment<V, NB>) };
            root.drop_recursive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::sentinel_key;
    use crossbeam_epoch as epoch;

    #[test]
    fn lazily_creates_sentinels_and_is_idempotent() {
        let trie: AccessTrie<u64, 4> = AccessTrie::new();
        let store: List<u64> = List::new();
        let guard = epoch::pin();

        let (_, s0) = store.sinsert_sentinel(None, sentinel_key(0), &guard);
        trie.seed_root_slot(0, s0);

        let h1 = trie.get_bucket(2, &store, &guard);
        let h2 = trie.get_bucket(2, &store, &guard);
        assert_eq!(h1.into_raw(), h2.into_raw(), "repeated lookups see the same sentinel");
    }

    #[test]
    fn grow_to_increases_access_size_and_preserves_depth() {
        let trie: AccessTrie<u64, 4> = AccessTrie::new();
        let initial = trie.access_size();
        trie.grow_to(initial * 4);
        assert!(trie.access_size() >= initial * 4);
        // Calling again with an already-satisfied target is a no-op.
        let grown = trie.access_size();
        trie.grow_to(grown);
        assert_eq!(trie.access_size(), grown);
    }
}
