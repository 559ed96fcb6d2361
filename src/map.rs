//! Map façade (spec §4.6, component C5) and resize protocol (spec §4.5,
//! component C4).
//!
//! [`SplitOrderedMap`] ties the lock-free sorted list ([`crate::list`])
//! and the access trie ([`crate::access_trie`]) together: every operation
//! hashes a key to a bucket index, asks the trie for that bucket's
//! sentinel (lazily materializing it if this is the first key ever routed
//! there), and delegates the actual search/insert/delete to the list
//! starting from that sentinel. Growth only ever changes which sentinel a
//! key resolves to — the list itself is never reorganized.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch};
use static_assertions::const_assert;

use crate::access_trie::AccessTrie;
use crate::error::MapConfigError;
use crate::key::{self, IdentityHash, KeyHasher};
use crate::list::List;

const NO_RESIZE: usize = 0;

/// A lock-free, concurrent, resizable hash map keyed by `u64` (spec §1).
///
/// `V` is the value type; `H` is the module parameter `hash_function`
/// (spec §6.1), defaulting to [`IdentityHash`]; `NB_BUCKET` is the access
/// trie's fan-out (spec §6.1 `nb_bucket`), fixed at the type level (see
/// `SPEC_FULL.md` §10.1 for why).
pub struct SplitOrderedMap<V, H = IdentityHash, const NB_BUCKET: usize = 16> {
    store: List<V>,
    access: AccessTrie<V, NB_BUCKET>,
    /// Logical modulus (spec §3.1 `size`): always a power of two, `<=
    /// access_size`.
    size: AtomicUsize,
    /// Approximate live-regular-node count (spec §3.3 invariant 6).
    content: AtomicUsize,
    /// Cached physical trie capacity; authoritative depth is
    /// [`AccessTrie::depth`], this is the fast-path read `check_size`
    /// compares against before deciding whether doubling `size` needs a
    /// trie growth too.
    access_size: AtomicUsize,
    /// `Some(target_access_size)` while a trie growth is in flight;
    /// `NO_RESIZE` ("no resize") otherwise (spec §3.2 `Map.resize`).
    resize: AtomicUsize,
    /// Target average bucket depth before `check_size` grows the table
    /// (spec §6.1 `load`).
    load: usize,
    hasher: H,
}

impl<V> SplitOrderedMap<V, IdentityHash, 16> {
    /// Creates an empty map with the default load factor (2) and the
    /// identity hash. Never fails: 2 is a valid load factor, so the
    /// validation in [`Self::try_with_load`] can't reject it — this just
    /// shares that validation path rather than duplicating it.
    pub fn new() -> Self {
        Self::try_with_load(2).expect("default load factor 2 is always valid")
    }

    /// Creates an empty map with a custom load factor, rejecting `load <
    /// 1` (spec §7).
    pub fn try_with_load(load: usize) -> Result<Self, MapConfigError> {
        Self::try_with_load_and_hasher(load, IdentityHash)
    }

    /// Creates an empty map with a custom load factor and the identity
    /// hash, panicking on the same misconfiguration
    /// [`Self::try_with_load`] rejects (spec §7: `load < 1` is a
    /// programming error, not a runtime condition callers are expected to
    /// handle). Use [`Self::try_with_load`] to handle it instead.
    pub fn with_load(load: usize) -> Self {
        Self::try_with_load(load).expect("load factor must be >= 1")
    }
}

impl<V> Default for SplitOrderedMap<V, IdentityHash, 16> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, H, const NB_BUCKET: usize> SplitOrderedMap<V, H, NB_BUCKET>
where
    H: KeyHasher,
{
    const _NB_BUCKET_IS_POWER_OF_TWO_AT_LEAST_TWO: () = {
        const_assert!(NB_BUCKET >= 2);
        const_assert!(NB_BUCKET.is_power_of_two());
    };

    /// Creates an empty map with a custom hasher and the default load
    /// factor.
    pub fn with_hasher(hasher: H) -> Self {
        Self::try_with_load_and_hasher(2, hasher).expect("default load factor 2 is always valid")
    }

    /// Creates an empty map with a custom load factor and hasher (spec
    /// §4.6 `create`).
    pub fn try_with_load_and_hasher(load: usize, hasher: H) -> Result<Self, MapConfigError> {
        let () = Self::_NB_BUCKET_IS_POWER_OF_TWO_AT_LEAST_TWO;
        if load < 1 {
            return Err(MapConfigError::InvalidLoadFactor(load));
        }

        let store = List::new();
        let access = AccessTrie::<V, NB_BUCKET>::new();
        let guard = epoch::pin();

        let (_, s0) = store.sinsert_sentinel(None, key::sentinel_key(0), &guard);
        let (_, s1) = store.sinsert_sentinel(Some(s0), key::sentinel_key(1), &guard);
        access.seed_root_slot(0, s0);
        access.seed_root_slot(1, s1);

        Ok(Self {
            store,
            access,
            size: AtomicUsize::new(2),
            content: AtomicUsize::new(0),
            access_size: AtomicUsize::new(NB_BUCKET),
            resize: AtomicUsize::new(NO_RESIZE),
            load,
            hasher,
        })
    }

    /// spec §4.6 `hash(t, k) = H(k) mod size`, reading `size` atomically
    /// once.
    fn bucket_of(&self, key: u64) -> u64 {
        let size = self.size.load(Ordering::Acquire) as u64;
        self.hasher.hash(key) % size
    }

    /// spec §4.2 `find`: returns the bucket's sentinel handle, lazily
    /// materializing trie cells and the sentinel itself. The trie derives
    /// its own starting depth from a live structural walk rather than
    /// from `self.access_size` (see `AccessTrie::get_bucket`'s doc
    /// comment) — that field lags a concurrent `help_resize`'s trie
    /// growth by design, and indexing off it directly here would walk an
    /// already-deeper root with a too-small level capacity.
    fn get_bucket<'g>(
        &'g self,
        hk: u64,
        guard: &'g epoch::Guard,
    ) -> crate::list::SentinelHandle<V> {
        self.access.get_bucket(hk, &self.store, guard)
    }

    /// spec §4.6 `find`.
    pub fn find<'g>(&'g self, key: u64, guard: &'g epoch::Guard) -> Option<&'g V> {
        self.check_size(guard);
        let hk = self.bucket_of(key);
        log::trace!(target: "split_ordered_map", "find key={key} bucket={hk}");
        let sentinel = self.get_bucket(hk, guard);
        self.store.find_value(sentinel, key::regular_key(self.hasher.hash(key)), guard)
    }

    /// spec §4.6 `mem`.
    pub fn mem(&self, key: u64, guard: &epoch::Guard) -> bool {
        self.find(key, guard).is_some()
    }

    /// spec §4.6 `add`. Existing keys are not overwritten (spec §9 Open
    /// Question 1): a no-op `add` on a live key still runs `check_size`.
    pub fn add(&self, key: u64, value: V, guard: &epoch::Guard) {
        self.check_size(guard);
        let hk = self.bucket_of(key);
        log::trace!(target: "split_ordered_map", "add key={key} bucket={hk}");
        let sentinel = self.get_bucket(hk, guard);
        let is_new = self
            .store
            .sinsert_regular(sentinel, key::regular_key(self.hasher.hash(key)), value, guard);
        if is_new {
            self.content.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// spec §4.6 `remove`.
    pub fn remove(&self, key: u64, guard: &epoch::Guard) -> bool {
        self.check_size(guard);
        let hk = self.bucket_of(key);
        log::trace!(target: "split_ordered_map", "remove key={key} bucket={hk}");
        let sentinel = self.get_bucket(hk, guard);
        let removed = self
            .store
            .sdelete(sentinel, key::regular_key(self.hasher.hash(key)), guard);
        if removed {
            self.content.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// spec §4.6 `elements`: best-effort, non-atomic traversal (spec
    /// Non-goals: no ordered iteration, no consistency beyond this).
    pub fn elements(&self, guard: &epoch::Guard) -> Vec<V>
    where
        V: Clone,
    {
        self.store.elements(guard).into_iter().cloned().collect()
    }

    /// Approximate element count (spec §3.3 invariant 6 / §5: not
    /// linearizable with list mutation, only a resize heuristic).
    pub fn len_approx(&self) -> usize {
        self.content.load(Ordering::Relaxed)
    }

    /// spec §4.5 `check_size`.
    fn check_size(&self, guard: &epoch::Guard) {
        loop {
            let size = self.size.load(Ordering::Acquire);
            let content = self.content.load(Ordering::Relaxed);
            if content / size.max(1) <= self.load {
                return;
            }

            let access_size = self.access_size.load(Ordering::Acquire);
            if 2 * size <= access_size {
                // Fast path: the trie already addresses enough buckets.
                if self
                    .size
                    .compare_exchange(size, 2 * size, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    log::debug!(target: "split_ordered_map", "size doubled {} -> {}", size, 2 * size);
                }
                continue;
            }

            let target = access_size.saturating_mul(NB_BUCKET).max(NB_BUCKET);
            let _ = self
                .resize
                .compare_exchange(NO_RESIZE, target, Ordering::AcqRel, Ordering::Acquire);
            self.help_resize(guard);
            // Fall through and re-check: growth may still be needed (spec
            // §4.5 step 4).
        }
    }

    /// spec §4.5 `help_resize`: the three-step idempotent CAS protocol any
    /// thread observing `resize != None` can run to completion on behalf
    /// of whichever thread discovered the need.
    fn help_resize(&self, _guard: &epoch::Guard) {
        let target = self.resize.load(Ordering::Acquire);
        if target == NO_RESIZE {
            return;
        }

        self.access.grow_to(target as u64);

        loop {
            let access_size = self.access_size.load(Ordering::Acquire);
            if access_size >= target {
                break;
            }
            if self
                .access_size
                .compare_exchange(access_size, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::debug!(target: "split_ordered_map", "access_size advanced to {target}");
                break;
            }
        }

        let _ = self
            .resize
            .compare_exchange(target, NO_RESIZE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Debug-only rendering (spec §6.2 `to_string`): not part of the
    /// concurrent contract, and not linearizable with concurrent mutation.
    pub fn to_string_with<F>(&self, render: F) -> String
    where
        F: Fn(&V) -> String,
    {
        let guard = epoch::pin();
        let values = self.store.elements(&guard);
        let rendered: Vec<String> = values.iter().map(|v| render(v)).collect();
        format!("SplitOrderedMap {{ {} }}", rendered.join(", "))
    }
}

impl<V, H, const NB_BUCKET: usize> std::fmt::Debug for SplitOrderedMap<V, H, NB_BUCKET> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitOrderedMap")
            .field("size", &self.size.load(Ordering::Relaxed))
            .field("access_size", &self.access_size.load(Ordering::Relaxed))
            .field("content_approx", &self.content.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> SplitOrderedMap<&'static str> {
        SplitOrderedMap::new()
    }

    #[test]
    fn empty_map_has_no_keys() {
        let t = map();
        let guard = epoch::pin();
        assert_eq!(t.find(1, &guard), None);
        assert!(!t.mem(1, &guard));
    }

    #[test]
    fn add_find_mem_remove() {
        let t = map();
        let guard = epoch::pin();
        t.add(1, "a", &guard);
        assert!(t.mem(1, &guard));
        assert_eq!(t.find(1, &guard), Some(&"a"));

        assert!(t.remove(1, &guard));
        assert!(!t.remove(1, &guard), "removing an absent key is a no-op");
        assert!(!t.mem(1, &guard));
        assert_eq!(t.find(1, &guard), None);
    }

    #[test]
    fn no_cross_talk_between_keys_in_the_same_bucket() {
        // nb_bucket=16, size starts at 2: keys 1 and 3 both hash (mod 2) to
        // bucket 1.
        let t: SplitOrderedMap<u64> = SplitOrderedMap::new();
        let guard = epoch::pin();
        t.add(1, 100, &guard);
        t.add(3, 300, &guard);
        assert_eq!(t.find(1, &guard), Some(&100));
        assert_eq!(t.find(3, &guard), Some(&300));
    }

    #[test]
    fn add_does_not_overwrite() {
        let t = map();
        let guard = epoch::pin();
        t.add(1, "a", &guard);
        t.add(1, "b", &guard);
        assert_eq!(t.find(1, &guard), Some(&"a"));
    }

    #[test]
    fn resize_grows_size_under_load() {
        // spec §8.4 S3: nb_bucket default 16, load 2; with identity hash
        // and 20 keys `size` must reach at least 8.
        let t: SplitOrderedMap<u64> = SplitOrderedMap::new();
        let guard = epoch::pin();
        for k in 0..20u64 {
            t.add(k, k, &guard);
        }
        assert!(t.size.load(Ordering::Relaxed) >= 8);
        for k in 0..20u64 {
            assert_eq!(t.find(k, &guard), Some(&k));
        }
    }

    #[test]
    fn elements_reflects_live_keys_only() {
        let t = map();
        let guard = epoch::pin();
        t.add(1, "a", &guard);
        t.add(2, "b", &guard);
        t.remove(1, &guard);
        let mut got = t.elements(&guard);
        got.sort();
        assert_eq!(got, vec!["b"]);
    }
}
