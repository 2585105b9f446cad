//! Occupancy statistics: how much of the cache is in use, and by how many
//! entries.
//!
//! ## Example Usage
//!
//! ```
//! use std::sync::Arc;
//! use cache_entry_stats::cache::Cache;
//! use cache_entry_stats::cache::sharded::ShardedCache;
//! use cache_entry_stats::clock::DefaultClock;
//! use cache_entry_stats::collector::StatsCollector;
//! use cache_entry_stats::stats::OccupancyStats;
//!
//! let cache = Arc::new(ShardedCache::new(4096));
//! let h = cache.insert(b"a", Arc::new([0u8; 100]), 100, None).unwrap();
//! cache.release(h);
//!
//! let collector =
//!     StatsCollector::<OccupancyStats>::get_shared(cache.clone(), Arc::new(DefaultClock::new())).unwrap();
//! let stats = collector.get_stats_default();
//! assert_eq!(stats.total_charge, 100);
//! assert_eq!(stats.cache_capacity, 4096);
//! println!("{stats}");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::cache::{Cache, EntryRef};
use crate::clock::SystemClock;
use crate::collector::CacheEntryStats;

/// Snapshot of cache occupancy from the most recent collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyStats {
    /// Resident entries seen during the pass.
    pub entry_count: u64,
    /// Sum of their charges.
    pub total_charge: u64,
    /// Largest single charge seen.
    pub max_entry_charge: usize,

    // gauges captured at the start of the pass
    pub cache_capacity: usize,
    pub cache_usage: usize,

    pub last_start_micros: u64,
    pub last_end_micros: u64,
    /// Completed passes since the collector was created.
    pub collections: u64,
    /// Requests served from this pass's result without rescanning.
    pub copies_of_last_collection: u64,
}

impl OccupancyStats {
    /// Duration of the most recent pass.
    pub fn collection_duration_micros(&self) -> u64 {
        self.last_end_micros.saturating_sub(self.last_start_micros)
    }

    /// Age of the result at `now_micros`.
    pub fn age_micros(&self, now_micros: u64) -> u64 {
        now_micros.saturating_sub(self.last_end_micros)
    }

    /// Fraction of capacity charged to entries seen by the pass.
    pub fn fill_ratio(&self) -> f64 {
        if self.cache_capacity == 0 {
            return 0.0;
        }
        self.total_charge as f64 / self.cache_capacity as f64
    }

    /// Flattened key/value view for property-style reporting.
    pub fn to_map(&self) -> BTreeMap<&'static str, String> {
        let mut map = BTreeMap::new();
        map.insert("entry_count", self.entry_count.to_string());
        map.insert("total_charge", self.total_charge.to_string());
        map.insert("max_entry_charge", self.max_entry_charge.to_string());
        map.insert("cache_capacity", self.cache_capacity.to_string());
        map.insert("cache_usage", self.cache_usage.to_string());
        map.insert(
            "collection_duration_micros",
            self.collection_duration_micros().to_string(),
        );
        map.insert("collections", self.collections.to_string());
        map.insert(
            "copies_of_last_collection",
            self.copies_of_last_collection.to_string(),
        );
        map
    }
}

impl CacheEntryStats for OccupancyStats {
    fn begin_collection(
        &mut self,
        cache: &dyn Cache,
        _clock: &dyn SystemClock,
        start_time_micros: u64,
    ) {
        self.entry_count = 0;
        self.total_charge = 0;
        self.max_entry_charge = 0;
        self.cache_capacity = cache.capacity();
        self.cache_usage = cache.usage();
        self.last_start_micros = start_time_micros;
    }

    fn entry_callback(&mut self) -> Box<dyn FnMut(&EntryRef<'_>) + '_> {
        Box::new(move |entry: &EntryRef<'_>| {
            self.entry_count += 1;
            self.total_charge += entry.charge as u64;
            self.max_entry_charge = self.max_entry_charge.max(entry.charge);
        })
    }

    fn end_collection(
        &mut self,
        _cache: &dyn Cache,
        _clock: &dyn SystemClock,
        end_time_micros: u64,
    ) {
        self.last_end_micros = end_time_micros;
        self.collections += 1;
        self.copies_of_last_collection = 0;
    }

    fn skipped_collection(&mut self) {
        self.copies_of_last_collection += 1;
    }
}

impl fmt::Display for OccupancyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entries={} charge={}/{} ({:.1}%) max_entry={} collected in {}us (pass #{}, {} copies)",
            self.entry_count,
            self.total_charge,
            self.cache_capacity,
            self.fill_ratio() * 100.0,
            self.max_entry_charge,
            self.collection_duration_micros(),
            self.collections,
            self.copies_of_last_collection,
        )
    }
}
