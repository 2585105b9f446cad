//! Deterministic key-to-shard mapping for the sharded cache.
//!
//! ## Architecture
//!
//! ```text
//!   Key bytes
//!       │
//!       ▼
//!   ┌───────────────────────────────────────────────┐
//!   │  ShardSelector { shards: 4, seed: 42 }        │
//!   │                                               │
//!   │  1. FxHasher::default()                       │
//!   │  2. hash seed, then key bytes                 │
//!   │  3. hasher.finish() % 4                       │
//!   └───────────────────────────────────────────────┘
//!       │
//!       ▼
//!   Shard Index: 0, 1, 2, or 3
//! ```
//!
//! `FxHasher` is unseeded, so the mapping is stable for the lifetime of the
//! process; the explicit `seed` lets two caches spread the same keys
//! differently.
//!
//! ## Example Usage
//!
//! ```
//! use cache_entry_stats::ds::ShardSelector;
//!
//! let selector = ShardSelector::new(4, 0);
//! let shard = selector.shard_for_key(b"user:123");
//! assert!(shard < 4);
//! assert_eq!(selector.shard_for_key(b"user:123"), shard);
//! ```

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Deterministic shard selector using a seeded hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSelector {
    shards: usize,
    seed: u64,
}

impl ShardSelector {
    /// Creates a selector for `shards` shards with the given `seed`.
    ///
    /// The shard count is clamped to at least 1.
    ///
    /// ```
    /// use cache_entry_stats::ds::ShardSelector;
    ///
    /// assert_eq!(ShardSelector::new(16, 0).shard_count(), 16);
    /// assert_eq!(ShardSelector::new(0, 0).shard_count(), 1);
    /// ```
    pub fn new(shards: usize, seed: u64) -> Self {
        Self {
            shards: shards.max(1),
            seed,
        }
    }

    /// Returns the number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Maps a key to a shard index in `[0, shards)`.
    pub fn shard_for_key(&self, key: &[u8]) -> usize {
        if self.shards == 1 {
            return 0;
        }
        let mut hasher = FxHasher::default();
        self.seed.hash(&mut hasher);
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards
    }
}

impl Default for ShardSelector {
    /// Creates a single-shard selector with seed 0.
    fn default() -> Self {
        Self::new(1, 0)
    }
}
