//! Shared, rate-limited statistics collection over every entry of a cache.
//!
//! Scanning a whole cache is expensive, and one cache is often shared by many
//! owners that each want statistics about it. [`StatsCollector`] keeps that
//! cost bounded:
//!
//! - **One collector per (cache, stats kind).** [`StatsCollector::get_shared`]
//!   stores the collector in the cache itself, under a key derived from the
//!   stats type, so every owner of the cache finds the same instance.
//! - **One scan at a time.** A per-collector mutex serializes collection; a
//!   caller that waited on a running scan receives its result.
//! - **Recent results are reused.** A new scan only starts once the saved
//!   result is older than the rescan window (at least one second, and at
//!   least 100 times the duration of the previous scan).
//!
//! ## Architecture
//!
//! ```text
//!   owner A ─┐                      ┌───────────────────── Cache ─────────────────────┐
//!   owner B ─┼─ get_shared(cache) ─►│ [key(S)] ─► StatsCollector<S>                   │
//!   owner C ─┘    (lookup, lock,    │               ├─ Mutex<CollectorState<S>>       │
//!                  re-check, insert)│               │     saved_stats, start, end     │
//!                                   │               └─ Weak<dyn Cache>, clock         │
//!                                   │ [block]  [block]  [block] ...                   │
//!                                   └─────────────────────────────────────────────────┘
//!
//!   get_stats(max_age):
//!     lock ─► stale? ─yes─► begin_collection ─► apply_to_all_entries ─► end_collection
//!              │
//!              no ──► skipped_collection
//!     copy saved_stats out ─► unlock
//! ```
//!
//! ## Example Usage
//!
//! ```
//! use std::sync::Arc;
//! use cache_entry_stats::cache::sharded::ShardedCache;
//! use cache_entry_stats::clock::ManualClock;
//! use cache_entry_stats::collector::StatsCollector;
//! use cache_entry_stats::stats::OccupancyStats;
//!
//! let cache = Arc::new(ShardedCache::new(1 << 20));
//! let clock = Arc::new(ManualClock::new(0));
//!
//! let collector = StatsCollector::<OccupancyStats>::get_shared(cache.clone(), clock.clone()).unwrap();
//! let first = collector.get_stats(180);
//! assert_eq!(first.collections, 1);
//!
//! // Within the rescan window the saved result is reused.
//! clock.advance_micros(500_000);
//! let again = collector.get_stats(180);
//! assert_eq!(again.collections, 1);
//! assert_eq!(again.copies_of_last_collection, 1);
//!
//! // A second owner gets the same collector.
//! let other = StatsCollector::<OccupancyStats>::get_shared(cache, clock).unwrap();
//! assert!(other.ptr_eq(&collector));
//! ```

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::{debug, trace};

use crate::cache::shared::SharedCacheHandle;
use crate::cache::{ApplyToAllEntriesOptions, Cache, CacheValue, Deleter, EntryRef};
use crate::clock::SystemClock;
use crate::error::CacheError;

/// Default `maximum_age_secs` for [`StatsCollector::get_stats_default`].
pub const DEFAULT_MAXIMUM_AGE_SECS: i32 = 180;

/// Shortest rescan window, in microseconds.
pub const MIN_RESCAN_INTERVAL_MICROS: u64 = 1_000_000;

/// Rescan window as a multiple of the previous scan's duration.
pub const SCAN_DURATION_MULTIPLIER: u64 = 100;

/// Initial end-of-scan timestamp. Together with a start of zero it makes the
/// never-collected state look like a long, long-ago scan.
pub const INITIAL_LAST_END_MICROS: u64 = 10_000_000;

/// Length of the cache key a collector is stored under.
pub const COLLECTOR_KEY_LEN: usize = 24;

const MICROS_PER_SEC: u64 = 1_000_000;

/// Lifecycle hooks of a statistics kind.
///
/// During a collection pass the collector calls, in order:
/// [`begin_collection`](Self::begin_collection), the callback returned by
/// [`entry_callback`](Self::entry_callback) once per resident entry, and
/// [`end_collection`](Self::end_collection). When the saved result is recent
/// enough, only [`skipped_collection`](Self::skipped_collection) is called.
///
/// All hooks run with the collector's lock held, so a copy handed to a caller
/// never reflects a half-finished pass.
pub trait CacheEntryStats: Clone + Default + Send + 'static {
    /// Called before any entry is visited.
    fn begin_collection(
        &mut self,
        cache: &dyn Cache,
        clock: &dyn SystemClock,
        start_time_micros: u64,
    );

    /// Returns the callback applied to each entry during this pass.
    fn entry_callback(&mut self) -> Box<dyn FnMut(&EntryRef<'_>) + '_>;

    /// Called after every entry was visited.
    fn end_collection(
        &mut self,
        cache: &dyn Cache,
        clock: &dyn SystemClock,
        end_time_micros: u64,
    );

    /// Called instead of a pass when the saved result is reused.
    fn skipped_collection(&mut self);
}

struct CollectorState<S> {
    saved_stats: S,
    last_start_time_micros: u64,
    last_end_time_micros: u64,
}

/// Rate-limited, shared collector of `S` over one cache.
///
/// Obtain one with [`get_shared`](Self::get_shared).
pub struct StatsCollector<S> {
    state: Mutex<CollectorState<S>>,
    // Weak: the collector lives inside the cache it scans.
    cache: Weak<dyn Cache>,
    clock: Arc<dyn SystemClock>,
}

impl<S: CacheEntryStats> StatsCollector<S> {
    fn new(cache: Weak<dyn Cache>, clock: Arc<dyn SystemClock>) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                saved_stats: S::default(),
                last_start_time_micros: 0,
                last_end_time_micros: INITIAL_LAST_END_MICROS,
            }),
            cache,
            clock,
        }
    }

    /// Returns the collector of `S` stored in `cache`, creating and inserting
    /// it on first use.
    ///
    /// Concurrent first calls for the same cache and stats kind converge on a
    /// single collector. The returned handle pins the collector's cache entry
    /// until its last clone is dropped.
    ///
    /// # Errors
    ///
    /// Returns the cache's error if the new collector cannot be inserted, and
    /// [`CacheError::KindMismatch`] if the collector key is occupied by a value
    /// that is not a `StatsCollector<S>`.
    pub fn get_shared(
        cache: Arc<dyn Cache>,
        clock: Arc<dyn SystemClock>,
    ) -> Result<SharedCacheHandle<Self>, CacheError> {
        let key = Self::cache_key();

        let handle = match cache.lookup(&key) {
            Some(handle) => handle,
            None => {
                // No insert-if-absent on Cache: serialize creators, then re-check.
                let creation_lock = creation_lock::<S>();
                let _guard = creation_lock.lock();
                match cache.lookup(&key) {
                    Some(handle) => handle,
                    None => {
                        let collector: CacheValue =
                            Arc::new(Self::new(Arc::downgrade(&cache), clock));
                        let deleter: Deleter = Self::delete_entry;
                        match cache.insert(&key, collector, 0, Some(deleter)) {
                            Ok(handle) => {
                                debug!(kind = type_name::<S>(), "created shared stats collector");
                                handle
                            },
                            Err(err) => {
                                debug!(
                                    kind = type_name::<S>(),
                                    error = %err,
                                    "failed to insert stats collector"
                                );
                                return Err(err);
                            },
                        }
                    },
                }
            },
        };

        // Checked by value type; `delete_entry::<S>` has no unique address.
        SharedCacheHandle::from_handle(cache, handle).ok_or(CacheError::KindMismatch)
    }

    /// Returns the statistics, rescanning the cache if the saved result is
    /// stale.
    ///
    /// `maximum_age_secs` is the requested freshness. The effective rescan
    /// window never drops below [`MIN_RESCAN_INTERVAL_MICROS`] or
    /// [`SCAN_DURATION_MULTIPLIER`] times the previous scan's duration.
    pub fn get_stats(&self, maximum_age_secs: i32) -> S {
        // Waits for any collection in progress.
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let max_age_micros = rescan_window_micros(
            maximum_age_secs,
            state.last_start_time_micros,
            state.last_end_time_micros,
        );

        let start_time_micros = self.clock.now_micros();
        let stale = is_stale(start_time_micros, state.last_end_time_micros, max_age_micros);
        match self.cache.upgrade() {
            Some(cache) if stale => {
                state.last_start_time_micros = start_time_micros;
                state
                    .saved_stats
                    .begin_collection(&*cache, &*self.clock, start_time_micros);
                {
                    let mut callback = state.saved_stats.entry_callback();
                    cache.apply_to_all_entries(
                        &mut *callback,
                        &ApplyToAllEntriesOptions::default(),
                    );
                }
                let end_time_micros = self.clock.now_micros();
                state.last_end_time_micros = end_time_micros;
                state
                    .saved_stats
                    .end_collection(&*cache, &*self.clock, end_time_micros);
                debug!(
                    kind = type_name::<S>(),
                    duration_micros = end_time_micros.saturating_sub(start_time_micros),
                    "collected cache entry stats"
                );
            },
            _ => {
                state.saved_stats.skipped_collection();
                trace!(kind = type_name::<S>(), max_age_micros, "reused saved cache entry stats");
            },
        }

        state.saved_stats.clone()
    }

    /// [`get_stats`](Self::get_stats) with [`DEFAULT_MAXIMUM_AGE_SECS`].
    pub fn get_stats_default(&self) -> S {
        self.get_stats(DEFAULT_MAXIMUM_AGE_SECS)
    }

    /// The cache being scanned, if it is still alive.
    pub fn cache(&self) -> Option<Arc<dyn Cache>> {
        self.cache.upgrade()
    }

    /// Start and end of the most recent collection pass, in microseconds.
    pub fn last_collection_window(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.last_start_time_micros, state.last_end_time_micros)
    }

    /// Key under which the collector of `S` is stored.
    ///
    /// The first 16 bytes identify stats collectors in general, the last 8
    /// are a hash of `S`'s `TypeId`. The key is stable for the life of the
    /// process.
    pub fn cache_key() -> [u8; COLLECTOR_KEY_LEN] {
        let mut key = [0u8; COLLECTOR_KEY_LEN];
        key[..8].copy_from_slice(&stable_hash("cache_entry_stats").to_le_bytes());
        key[8..16].copy_from_slice(&stable_hash("StatsCollector").to_le_bytes());
        key[16..].copy_from_slice(&stable_hash(&TypeId::of::<S>()).to_le_bytes());
        key
    }

    fn delete_entry(_key: &[u8], value: CacheValue) {
        trace!(kind = type_name::<S>(), "dropping stats collector entry");
        drop(value);
    }
}

impl<S> fmt::Debug for StatsCollector<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StatsCollector")
            .field("kind", &type_name::<S>())
            .field("last_start_time_micros", &state.last_start_time_micros)
            .field("last_end_time_micros", &state.last_end_time_micros)
            .finish_non_exhaustive()
    }
}

/// Effective rescan window for a request.
///
/// NOTE: the requested age is clamped with `min(.., 0)`, so it never widens
/// the window; in practice only the adaptive floor applies.
pub(crate) fn rescan_window_micros(
    maximum_age_secs: i32,
    last_start_time_micros: u64,
    last_end_time_micros: u64,
) -> u64 {
    let requested = u64::try_from(maximum_age_secs.min(0)).unwrap_or(0) * MICROS_PER_SEC;
    let last_duration = last_end_time_micros.saturating_sub(last_start_time_micros);
    let floor =
        MIN_RESCAN_INTERVAL_MICROS.max(SCAN_DURATION_MULTIPLIER.saturating_mul(last_duration));
    requested.max(floor)
}

/// A reading behind the last end time (e.g. before the first scan) counts as
/// stale.
fn is_stale(now_micros: u64, last_end_time_micros: u64, max_age_micros: u64) -> bool {
    now_micros
        .checked_sub(last_end_time_micros)
        .map_or(true, |age| age > max_age_micros)
}

fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Process-wide creation lock for stats kind `S`, created on first use.
fn creation_lock<S: Any>() -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<FxHashMap<TypeId, Arc<Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(Default::default);
    let mut locks = locks.lock();
    Arc::clone(locks.entry(TypeId::of::<S>()).or_default())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;
    use crate::builder::CacheBuilder;
    use crate::cache::sharded::ShardedCache;
    use crate::clock::ManualClock;

    /// Records the hooks it sees and counts charge.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct Probe {
        events: Vec<&'static str>,
        entries: usize,
        charge: usize,
        begin_micros: u64,
        end_micros: u64,
    }

    impl CacheEntryStats for Probe {
        fn begin_collection(&mut self, _cache: &dyn Cache, _clock: &dyn SystemClock, start: u64) {
            self.events.push("begin");
            self.entries = 0;
            self.charge = 0;
            self.begin_micros = start;
        }

        fn entry_callback(&mut self) -> Box<dyn FnMut(&EntryRef<'_>) + '_> {
            Box::new(move |entry: &EntryRef<'_>| {
                self.entries += 1;
                self.charge += entry.charge;
            })
        }

        fn end_collection(&mut self, _cache: &dyn Cache, _clock: &dyn SystemClock, end: u64) {
            self.events.push("end");
            self.end_micros = end;
        }

        fn skipped_collection(&mut self) {
            self.events.push("skip");
        }
    }

    /// Advances the clock by a fixed amount for every entry it visits.
    #[derive(Clone, Default)]
    struct SlowScan {
        clock: Option<Arc<ManualClock>>,
        scans: usize,
    }

    impl CacheEntryStats for SlowScan {
        fn begin_collection(&mut self, _: &dyn Cache, _: &dyn SystemClock, _: u64) {}

        fn entry_callback(&mut self) -> Box<dyn FnMut(&EntryRef<'_>) + '_> {
            let clock = self.clock.clone();
            Box::new(move |_: &EntryRef<'_>| {
                if let Some(clock) = &clock {
                    clock.advance_micros(10_000);
                }
            })
        }

        fn end_collection(&mut self, _: &dyn Cache, _: &dyn SystemClock, _: u64) {
            self.scans += 1;
        }

        fn skipped_collection(&mut self) {}
    }

    fn setup() -> (Arc<ShardedCache>, Arc<ManualClock>) {
        let cache = Arc::new(CacheBuilder::new(1 << 20).shard_count(4).build());
        (cache, Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn first_call_scans_then_skips() {
        let (cache, clock) = setup();
        let collector = StatsCollector::<Probe>::get_shared(cache.clone(), clock.clone()).unwrap();

        let first = collector.get_stats(180);
        assert_eq!(first.events, vec!["begin", "end"]);
        assert_eq!(collector.last_collection_window(), (0, 0));

        let second = collector.get_stats(180);
        assert_eq!(second.events, vec!["begin", "end", "skip"]);
        assert_eq!(second.entries, first.entries);
        assert_eq!(second.charge, first.charge);
    }

    #[test]
    fn scan_counts_resident_entries() {
        let (cache, clock) = setup();
        for i in 0..10u32 {
            let h = cache.insert(&i.to_le_bytes(), Arc::new(i), 5, None).unwrap();
            cache.release(h);
        }
        let collector = StatsCollector::<Probe>::get_shared(cache.clone(), clock).unwrap();
        let stats = collector.get_stats(180);
        // The collector's own zero-charge entry is resident too.
        assert_eq!(stats.entries, 11);
        assert_eq!(stats.charge, 50);
    }

    #[test]
    fn rescans_after_window_elapses() {
        let (cache, clock) = setup();
        let collector = StatsCollector::<Probe>::get_shared(cache.clone(), clock.clone()).unwrap();
        collector.get_stats(180);

        clock.advance_micros(MIN_RESCAN_INTERVAL_MICROS);
        assert_eq!(collector.get_stats(180).events.last(), Some(&"skip"));

        clock.advance_micros(1);
        let stats = collector.get_stats(180);
        assert_eq!(stats.events, vec!["begin", "end", "skip", "begin", "end"]);
        assert_eq!(stats.begin_micros, MIN_RESCAN_INTERVAL_MICROS + 1);
    }

    #[test]
    fn slow_scan_widens_window() {
        let (cache, clock) = setup();
        for i in 0..50u32 {
            let h = cache.insert(&i.to_le_bytes(), Arc::new(()), 1, None).unwrap();
            cache.release(h);
        }
        let collector = StatsCollector::<SlowScan>::get_shared(cache.clone(), clock.clone()).unwrap();
        {
            let mut state = collector.state.lock();
            state.saved_stats.clock = Some(clock.clone());
        }
        collector.get_stats(0);
        let (start, end) = collector.last_collection_window();
        let duration = end - start;
        // 51 entries (50 + the collector) at 10ms each.
        assert_eq!(duration, 510_000);

        // 100x the duration is 51s; well past the one-second minimum.
        clock.advance_micros(50 * MICROS_PER_SEC);
        assert_eq!(collector.get_stats(0).scans, 1);
        clock.advance_micros(2 * MICROS_PER_SEC);
        assert_eq!(collector.get_stats(0).scans, 2);
    }

    #[test]
    fn initial_state_collects_for_clock_readings_past_sentinel() {
        let (cache, clock) = setup();
        clock.set_micros(INITIAL_LAST_END_MICROS + 1_000 * MICROS_PER_SEC + 1);
        let collector = StatsCollector::<Probe>::get_shared(cache.clone(), clock).unwrap();
        assert_eq!(collector.get_stats(180).events, vec!["begin", "end"]);
    }

    #[test]
    fn shared_handles_resolve_to_one_collector() {
        let (cache, clock) = setup();
        let a = StatsCollector::<Probe>::get_shared(cache.clone(), clock.clone()).unwrap();
        let b = StatsCollector::<Probe>::get_shared(cache.clone(), clock.clone()).unwrap();
        assert!(a.ptr_eq(&b));

        a.get_stats(180);
        // b sees the scan a triggered.
        assert_eq!(b.get_stats(180).events, vec!["begin", "end", "skip"]);
    }

    #[test]
    fn kinds_do_not_collide() {
        let (cache, clock) = setup();
        assert_ne!(
            StatsCollector::<Probe>::cache_key(),
            StatsCollector::<SlowScan>::cache_key()
        );
        let _probe = StatsCollector::<Probe>::get_shared(cache.clone(), clock.clone()).unwrap();
        let _slow = StatsCollector::<SlowScan>::get_shared(cache.clone(), clock).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn separate_caches_get_separate_collectors() {
        let (cache_a, clock) = setup();
        let (cache_b, _) = setup();
        let a = StatsCollector::<Probe>::get_shared(cache_a.clone(), clock.clone()).unwrap();
        let b = StatsCollector::<Probe>::get_shared(cache_b.clone(), clock).unwrap();
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn insert_failure_is_returned() {
        let (cache, clock) = setup();
        cache.close();
        let err = StatsCollector::<Probe>::get_shared(cache.clone(), clock).unwrap_err();
        assert_eq!(err, CacheError::Closed);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn foreign_value_under_key_is_rejected() {
        let (cache, clock) = setup();
        let key = StatsCollector::<Probe>::cache_key();
        let h = cache.insert(&key, Arc::new(0u8), 0, None).unwrap();
        cache.release(h);
        let err = StatsCollector::<Probe>::get_shared(cache.clone(), clock).unwrap_err();
        assert_eq!(err, CacheError::KindMismatch);
        // The lookup's reference was handed back.
        assert_eq!(cache.erase_unreferenced(), 1);
    }

    fn delete_from_other_crate(_key: &[u8], value: CacheValue) {
        drop(value);
    }

    #[test]
    fn collector_inserted_with_another_deleter_is_shared() {
        let (cache, clock) = setup();
        let dyn_cache: Arc<dyn Cache> = cache.clone();
        let existing = Arc::new(StatsCollector::<Probe>::new(
            Arc::downgrade(&dyn_cache),
            clock.clone(),
        ));
        let value: CacheValue = existing.clone();
        let deleter: Deleter = delete_from_other_crate;
        let h = cache
            .insert(&StatsCollector::<Probe>::cache_key(), value, 0, Some(deleter))
            .unwrap();
        cache.release(h);

        let shared = StatsCollector::<Probe>::get_shared(dyn_cache, clock).unwrap();
        assert!(Arc::ptr_eq(shared.value(), &existing));
        assert_eq!(shared.get_stats(180).events, vec!["begin", "end"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn key_discriminates_by_type_identity() {
        let probe = StatsCollector::<Probe>::cache_key();
        let slow = StatsCollector::<SlowScan>::cache_key();
        assert_eq!(probe[..16], slow[..16]);
        assert_eq!(probe[16..], stable_hash(&TypeId::of::<Probe>()).to_le_bytes());
        assert_eq!(probe, StatsCollector::<Probe>::cache_key());
    }

    static PROBE_DROPS: AtomicUsize = AtomicUsize::new(0);

    /// Counts its drops. Only the collector's saved copy is ever created, as
    /// long as `get_stats` is not called.
    #[derive(Clone, Default)]
    struct DropProbe;

    impl CacheEntryStats for DropProbe {
        fn begin_collection(&mut self, _: &dyn Cache, _: &dyn SystemClock, _: u64) {}
        fn entry_callback(&mut self) -> Box<dyn FnMut(&EntryRef<'_>) + '_> {
            Box::new(|_: &EntryRef<'_>| {})
        }
        fn end_collection(&mut self, _: &dyn Cache, _: &dyn SystemClock, _: u64) {}
        fn skipped_collection(&mut self) {}
    }

    impl Drop for DropProbe {
        fn drop(&mut self) {
            PROBE_DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn collector_dropped_once_after_release_and_erase() {
        let (cache, clock) = setup();
        let handle = StatsCollector::<DropProbe>::get_shared(cache.clone(), clock).unwrap();
        let clone = handle.clone();

        assert_eq!(cache.erase_unreferenced(), 0);
        drop(handle);
        drop(clone);
        assert_eq!(PROBE_DROPS.load(Ordering::SeqCst), 0);

        assert_eq!(cache.erase_unreferenced(), 1);
        assert_eq!(PROBE_DROPS.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().frees, 1);
    }

    proptest! {
        #[test]
        fn window_respects_adaptive_floor(
            age in any::<i32>(),
            start in 0u64..1 << 40,
            duration in 0u64..1 << 30,
        ) {
            let window = rescan_window_micros(age, start, start + duration);
            prop_assert!(window >= MIN_RESCAN_INTERVAL_MICROS);
            prop_assert!(window >= SCAN_DURATION_MULTIPLIER * duration);
            prop_assert_eq!(
                window,
                MIN_RESCAN_INTERVAL_MICROS.max(SCAN_DURATION_MULTIPLIER * duration)
            );
        }

        #[test]
        fn stale_only_past_window(last_end in 0u64..1 << 40, delta in 0u64..1 << 30, window in 0u64..1 << 30) {
            prop_assert_eq!(is_stale(last_end + delta, last_end, window), delta > window);
        }
    }
}
