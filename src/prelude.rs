pub use crate::builder::CacheBuilder;
pub use crate::cache::shared::SharedCacheHandle;
pub use crate::cache::sharded::{CacheMetrics, ShardedCache};
pub use crate::cache::{ApplyToAllEntriesOptions, Cache, CacheValue, Deleter, EntryRef, Handle};
pub use crate::clock::{DefaultClock, ManualClock, SystemClock};
pub use crate::collector::{CacheEntryStats, DEFAULT_MAXIMUM_AGE_SECS, StatsCollector};
pub use crate::error::{CacheError, ConfigError};
pub use crate::stats::OccupancyStats;
