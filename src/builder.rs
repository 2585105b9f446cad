//! Builder for [`ShardedCache`].
//!
//! ## Example
//!
//! ```rust
//! use cache_entry_stats::builder::CacheBuilder;
//! use cache_entry_stats::cache::Cache;
//!
//! let cache = CacheBuilder::new(64 << 20)
//!     .shard_count(16)
//!     .strict_capacity_limit(false)
//!     .build();
//! assert_eq!(cache.capacity(), 64 << 20);
//! assert_eq!(cache.shard_count(), 16);
//! ```

use crate::cache::sharded::ShardedCache;
use crate::error::ConfigError;

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 8;

/// Configuration for a [`ShardedCache`].
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    capacity: usize,
    shard_count: usize,
    strict_capacity_limit: bool,
    seed: u64,
}

impl CacheBuilder {
    /// Starts a builder for a cache holding up to `capacity` charge units.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shard_count: DEFAULT_SHARD_COUNT,
            strict_capacity_limit: false,
            seed: 0,
        }
    }

    /// Number of independently locked shards.
    pub fn shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Reject inserts that do not fit instead of overcommitting.
    pub fn strict_capacity_limit(mut self, strict: bool) -> Self {
        self.strict_capacity_limit = strict;
        self
    }

    /// Seed for key-to-shard placement.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Builds the cache, clamping a zero shard count to one.
    pub fn build(self) -> ShardedCache {
        ShardedCache::from_parts(
            self.capacity,
            self.shard_count.max(1),
            self.strict_capacity_limit,
            self.seed,
        )
    }

    /// Builds the cache after validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `shard_count` is zero or exceeds `capacity`
    /// while a strict capacity limit is requested (some shards could then hold
    /// nothing at all).
    pub fn try_build(self) -> Result<ShardedCache, ConfigError> {
        if self.shard_count == 0 {
            return Err(ConfigError::new("shard_count must be > 0"));
        }
        if self.strict_capacity_limit && self.shard_count > self.capacity {
            return Err(ConfigError::new(format!(
                "shard_count ({}) must not exceed capacity ({}) with a strict capacity limit",
                self.shard_count, self.capacity
            )));
        }
        Ok(self.build())
    }
}
