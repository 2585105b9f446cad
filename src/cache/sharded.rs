//! Sharded, thread-safe [`Cache`] implementation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ShardedCache                              │
//! │                                                                      │
//! │   key ──► ShardSelector ──► Mutex<Shard>                             │
//! │                              ├─ table: FxHashMap<key, Arc<Entry>>    │
//! │                              ├─ order: VecDeque<(key, seq)>          │
//! │                              └─ usage / capacity (charge units)      │
//! │                                                                      │
//! │   counters: AtomicU64 hits/misses/inserts/evictions/...              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Eviction
//!
//! Each shard evicts in insertion order. Records in `order` carry the
//! sequence number of the entry they were pushed for; a record whose entry was
//! since erased or replaced is stale and skipped. Referenced entries are never
//! evicted: their record is moved to the back of the queue (second chance).
//! A shard that cannot make room either rejects the insert
//! (`strict_capacity_limit`) or overcommits until a later insert evicts.
//!
//! ## Thread Safety
//!
//! Every mutation of an entry's reference count or residency happens under its
//! shard's lock, so exactly one thread observes the "detached and
//! unreferenced" transition and runs the deleter. Deleters and
//! `apply_to_all_entries` callbacks run with no shard lock held.
//!
//! ## Example Usage
//!
//! ```
//! use std::sync::Arc;
//! use cache_entry_stats::cache::Cache;
//! use cache_entry_stats::cache::sharded::ShardedCache;
//!
//! let cache = ShardedCache::new(1024);
//! let handle = cache.insert(b"block:1", Arc::new(vec![0u8; 64]), 64, None).unwrap();
//! assert_eq!(cache.usage(), 64);
//! cache.release(handle);
//!
//! let handle = cache.lookup(b"block:1").unwrap();
//! assert_eq!(handle.charge(), 64);
//! cache.release(handle);
//! assert_eq!(cache.metrics().hits, 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::builder::CacheBuilder;
use crate::cache::{
    ApplyToAllEntriesOptions, Cache, CacheEntry, CacheValue, Deleter, EntryRef, Handle,
};
use crate::ds::ShardSelector;
use crate::error::CacheError;

/// Snapshot of cache-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub insert_failures: u64,
    pub evictions: u64,
    pub erases: u64,
    /// Entries freed, i.e. deleters run (or would have run, for entries
    /// inserted without one).
    pub frees: u64,
}

/// Relaxed atomic counters; a snapshot may be slightly inconsistent across
/// fields under concurrency.
#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    insert_failures: AtomicU64,
    evictions: AtomicU64,
    erases: AtomicU64,
    frees: AtomicU64,
}

impl CacheCounters {
    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            insert_failures: self.insert_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            erases: self.erases.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        if n > 0 {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

struct Shard {
    table: FxHashMap<Box<[u8]>, Arc<CacheEntry>>,
    order: VecDeque<(Box<[u8]>, u64)>,
    usage: usize,
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            table: FxHashMap::default(),
            order: VecDeque::new(),
            usage: 0,
            capacity,
        }
    }

    /// Takes `entry` out of the table's accounting. The caller has already
    /// removed it from `table`.
    fn detach(&mut self, entry: &CacheEntry) {
        entry.resident.store(false, Ordering::Release);
        self.usage -= entry.charge();
    }

    /// Evicts unreferenced entries until `charge` more fits or nothing
    /// evictable is left. Evicted entries that are now free go to `freed`.
    fn make_room(&mut self, charge: usize, freed: &mut Vec<Arc<CacheEntry>>) -> usize {
        let mut evicted = 0;
        let mut budget = self.order.len();
        while self.usage.saturating_add(charge) > self.capacity && budget > 0 {
            budget -= 1;
            let Some((key, seq)) = self.order.pop_front() else {
                break;
            };
            let referenced = match self.table.get(&key) {
                Some(entry) if entry.seq == seq => entry.refs.load(Ordering::Acquire) > 0,
                // stale
                _ => continue,
            };
            if referenced {
                self.order.push_back((key, seq));
                continue;
            }
            if let Some(entry) = self.table.remove(&key) {
                self.detach(&entry);
                freed.push(entry);
                evicted += 1;
            }
        }
        evicted
    }

    /// Drops stale order records once they dominate the queue.
    fn compact_order(&mut self) {
        if self.order.len() <= 2 * self.table.len() + 16 {
            return;
        }
        let table = &self.table;
        self.order
            .retain(|(key, seq)| table.get(key).is_some_and(|entry| entry.seq == *seq));
    }
}

/// Thread-safe cache split into independently locked shards.
///
/// Built with [`CacheBuilder`] or [`ShardedCache::new`].
pub struct ShardedCache {
    shards: Box<[Mutex<Shard>]>,
    selector: ShardSelector,
    capacity: usize,
    strict_capacity_limit: bool,
    closed: AtomicBool,
    next_seq: AtomicU64,
    counters: CacheCounters,
}

impl ShardedCache {
    /// Creates a cache with the default builder settings and the given total
    /// charge capacity.
    pub fn new(capacity: usize) -> Self {
        CacheBuilder::new(capacity).build()
    }

    pub(crate) fn from_parts(
        capacity: usize,
        shard_count: usize,
        strict_capacity_limit: bool,
        seed: u64,
    ) -> Self {
        let selector = ShardSelector::new(shard_count, seed);
        let n = selector.shard_count();
        let shards = (0..n)
            .map(|i| {
                let extra = usize::from(i < capacity % n);
                Mutex::new(Shard::new(capacity / n + extra))
            })
            .collect();
        Self {
            shards,
            selector,
            capacity,
            strict_capacity_limit,
            closed: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    fn shard(&self, key: &[u8]) -> &Mutex<Shard> {
        &self.shards[self.selector.shard_for_key(key)]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn strict_capacity_limit(&self) -> bool {
        self.strict_capacity_limit
    }

    /// Stops accepting inserts. Lookups, releases and erases keep working.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Erases every unreferenced entry. Returns how many were erased.
    pub fn erase_unreferenced(&self) -> usize {
        let mut freed = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let mut released = 0;
            shard.table.retain(|_, entry| {
                if entry.refs.load(Ordering::Acquire) > 0 {
                    return true;
                }
                entry.resident.store(false, Ordering::Release);
                released += entry.charge();
                freed.push(Arc::clone(entry));
                false
            });
            shard.usage -= released;
            shard.order.clear();
            let Shard { table, order, .. } = &mut *shard;
            order.extend(table.iter().map(|(key, entry)| (key.clone(), entry.seq)));
        }
        let erased = freed.len();
        CacheCounters::add(&self.counters.erases, erased);
        self.free(freed);
        erased
    }

    /// Returns a snapshot of the cache counters.
    pub fn metrics(&self) -> CacheMetrics {
        self.counters.snapshot()
    }

    fn free(&self, entries: Vec<Arc<CacheEntry>>) {
        CacheCounters::add(&self.counters.frees, entries.len());
        for entry in entries {
            trace!(key = ?entry.key(), charge = entry.charge(), "freeing cache entry");
            entry.run_deleter();
        }
    }
}

impl Cache for ShardedCache {
    fn lookup(&self, key: &[u8]) -> Option<Handle> {
        let shard = self.shard(key).lock();
        match shard.table.get(key) {
            Some(entry) => {
                entry.refs.fetch_add(1, Ordering::AcqRel);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(Handle::new(Arc::clone(entry)))
            },
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    fn insert(
        &self,
        key: &[u8],
        value: CacheValue,
        charge: usize,
        deleter: Option<Deleter>,
    ) -> Result<Handle, CacheError> {
        if self.is_closed() {
            self.counters.insert_failures.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::Closed);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CacheEntry::with_seq(key, value, charge, deleter, seq));
        entry.refs.store(1, Ordering::Release);

        let mut freed = Vec::new();
        let outcome = {
            let mut shard = self.shard(key).lock();
            let evicted = shard.make_room(charge, &mut freed);
            if self.strict_capacity_limit && shard.usage.saturating_add(charge) > shard.capacity {
                Err((
                    evicted,
                    CacheError::CapacityExceeded {
                        charge,
                        usage: shard.usage,
                        capacity: shard.capacity,
                    },
                ))
            } else {
                if let Some(old) = shard.table.insert(key.into(), Arc::clone(&entry)) {
                    shard.detach(&old);
                    if old.refs.load(Ordering::Acquire) == 0 {
                        freed.push(old);
                    }
                }
                shard.usage += charge;
                shard.order.push_back((key.into(), seq));
                shard.compact_order();
                Ok(evicted)
            }
        };

        let result = match outcome {
            Ok(evicted) => {
                CacheCounters::add(&self.counters.evictions, evicted);
                self.counters.inserts.fetch_add(1, Ordering::Relaxed);
                Ok(Handle::new(entry))
            },
            Err((evicted, err)) => {
                CacheCounters::add(&self.counters.evictions, evicted);
                self.counters.insert_failures.fetch_add(1, Ordering::Relaxed);
                trace!(key = ?key, charge, error = %err, "cache insert rejected");
                Err(err)
            },
        };
        self.free(freed);
        result
    }

    fn release(&self, handle: Handle) -> bool {
        let entry = handle.into_entry();
        let free = {
            let _shard = self.shard(entry.key()).lock();
            let previous = entry.refs.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "released a handle with no references");
            previous == 1 && !entry.resident.load(Ordering::Acquire)
        };
        if free {
            self.free(vec![entry]);
        }
        free
    }

    fn erase(&self, key: &[u8]) {
        let freed = {
            let mut shard = self.shard(key).lock();
            match shard.table.remove(key) {
                Some(entry) => {
                    shard.detach(&entry);
                    self.counters.erases.fetch_add(1, Ordering::Relaxed);
                    (entry.refs.load(Ordering::Acquire) == 0).then_some(entry)
                },
                None => None,
            }
        };
        if let Some(entry) = freed {
            self.free(vec![entry]);
        }
    }

    fn apply_to_all_entries(
        &self,
        callback: &mut dyn FnMut(&EntryRef<'_>),
        _options: &ApplyToAllEntriesOptions,
    ) {
        for shard in self.shards.iter() {
            let entries: Vec<Arc<CacheEntry>> = shard.lock().table.values().cloned().collect();
            for entry in &entries {
                callback(&EntryRef::from_entry(entry));
            }
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn usage(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().usage).sum()
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().table.len()).sum()
    }
}

impl Drop for ShardedCache {
    fn drop(&mut self) {
        for shard in self.shards.iter_mut() {
            let shard = shard.get_mut();
            shard.order.clear();
            shard.usage = 0;
            for (_, entry) in shard.table.drain() {
                entry.resident.store(false, Ordering::Release);
                // Entries still referenced by raw handles outlive the cache
                // without their deleter ever running.
                if entry.refs.load(Ordering::Acquire) == 0 {
                    entry.run_deleter();
                }
            }
        }
    }
}

impl fmt::Debug for ShardedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedCache")
            .field("capacity", &self.capacity)
            .field("shards", &self.shards.len())
            .field("strict_capacity_limit", &self.strict_capacity_limit)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    static FREED: AtomicUsize = AtomicUsize::new(0);

    fn counting_deleter(_key: &[u8], _value: CacheValue) {
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    fn single_shard(capacity: usize) -> ShardedCache {
        CacheBuilder::new(capacity).shard_count(1).build()
    }

    #[test]
    fn insert_lookup_release() {
        let cache = single_shard(10);
        let h = cache.insert(b"a", Arc::new(1u32), 2, None).unwrap();
        assert_eq!(h.value().downcast_ref::<u32>(), Some(&1));
        assert!(!cache.release(h));

        let h = cache.lookup(b"a").expect("resident");
        assert_eq!(h.key(), b"a");
        cache.release(h);
        assert!(cache.lookup(b"missing").is_none());

        let m = cache.metrics();
        assert_eq!(m.inserts, 1);
        assert_eq!(m.hits, 1);
        assert_eq!(m.misses, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.usage(), 2);
    }

    #[test]
    fn evicts_unreferenced_in_insertion_order() {
        let cache = single_shard(2);
        for key in [b"a", b"b", b"c"] {
            let h = cache.insert(key, Arc::new(()), 1, None).unwrap();
            cache.release(h);
        }
        assert!(cache.lookup(b"a").is_none());
        let b = cache.lookup(b"b").unwrap();
        let c = cache.lookup(b"c").unwrap();
        cache.release(b);
        cache.release(c);
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn referenced_entries_survive_eviction() {
        let cache = single_shard(1);
        let pinned = cache.insert(b"pinned", Arc::new(()), 1, None).unwrap();
        let other = cache.insert(b"other", Arc::new(()), 1, None).unwrap();
        // Non-strict: the shard overcommits rather than evicting "pinned".
        assert_eq!(cache.usage(), 2);
        assert!(!cache.release(other));

        // The next insert evicts "other" and skips the referenced entry.
        let h = cache.insert(b"third", Arc::new(()), 1, None).unwrap();
        cache.release(h);
        assert!(cache.lookup(b"other").is_none());
        let again = cache.lookup(b"pinned").expect("pinned stays resident");
        assert!(!cache.release(again));
        assert!(!cache.release(pinned));
        assert_eq!(cache.metrics().evictions, 1);
        assert_eq!(cache.usage(), 2);
    }

    #[test]
    fn strict_limit_rejects_insert() {
        let cache = CacheBuilder::new(1)
            .shard_count(1)
            .strict_capacity_limit(true)
            .build();
        let pinned = cache.insert(b"pinned", Arc::new(()), 1, None).unwrap();
        let err = cache.insert(b"x", Arc::new(()), 1, None).unwrap_err();
        assert_eq!(
            err,
            CacheError::CapacityExceeded {
                charge: 1,
                usage: 1,
                capacity: 1
            }
        );
        assert_eq!(cache.metrics().insert_failures, 1);
        cache.release(pinned);
    }

    #[test]
    fn closed_cache_rejects_insert() {
        let cache = single_shard(10);
        cache.close();
        assert!(cache.is_closed());
        assert_eq!(
            cache.insert(b"a", Arc::new(()), 0, None).unwrap_err(),
            CacheError::Closed
        );
    }

    #[test]
    fn deleter_runs_once_after_erase_and_release() {
        let before = FREED.load(Ordering::SeqCst);
        let cache = single_shard(10);
        let h = cache
            .insert(b"d", Arc::new(()), 1, Some(counting_deleter))
            .unwrap();
        assert!(cache.get_deleter(&h).is_some());
        cache.erase(b"d");
        assert_eq!(FREED.load(Ordering::SeqCst), before);
        assert!(cache.release(h));
        assert_eq!(FREED.load(Ordering::SeqCst), before + 1);
        cache.erase(b"d");
        assert_eq!(FREED.load(Ordering::SeqCst), before + 1);
        assert_eq!(cache.metrics().frees, 1);
    }

    #[test]
    fn replace_detaches_previous_entry() {
        let cache = single_shard(10);
        let old = cache.insert(b"k", Arc::new(1u8), 3, None).unwrap();
        let new = cache.insert(b"k", Arc::new(2u8), 4, None).unwrap();
        assert_eq!(cache.usage(), 4);
        assert_eq!(cache.len(), 1);
        assert!(cache.release(old));
        assert!(!cache.release(new));
        let h = cache.lookup(b"k").unwrap();
        assert_eq!(h.value().downcast_ref::<u8>(), Some(&2));
        cache.release(h);
    }

    #[test]
    fn apply_visits_every_resident_entry() {
        let cache = CacheBuilder::new(100).shard_count(4).build();
        for i in 0..20u32 {
            let h = cache.insert(&i.to_le_bytes(), Arc::new(i), 1, None).unwrap();
            cache.release(h);
        }
        let mut seen = 0;
        let mut total = 0usize;
        cache.apply_to_all_entries(
            &mut |entry: &EntryRef<'_>| {
                seen += 1;
                total += entry.charge;
            },
            &ApplyToAllEntriesOptions::default(),
        );
        assert_eq!(seen, 20);
        assert_eq!(total, 20);
    }

    #[test]
    fn erase_unreferenced_keeps_pinned() {
        let cache = single_shard(10);
        let pinned = cache.insert(b"p", Arc::new(()), 1, None).unwrap();
        let h = cache.insert(b"u", Arc::new(()), 1, None).unwrap();
        cache.release(h);
        assert_eq!(cache.erase_unreferenced(), 1);
        assert_eq!(cache.len(), 1);
        cache.release(pinned);
    }

    #[test]
    fn capacity_split_across_shards() {
        let cache = CacheBuilder::new(10).shard_count(4).build();
        let per_shard: Vec<usize> = cache.shards.iter().map(|s| s.lock().capacity).collect();
        assert_eq!(per_shard, vec![3, 3, 2, 2]);
        assert_eq!(cache.capacity(), 10);
    }
}
