//! Error types for the cache-entry-stats library.
//!
//! ## Key Components
//!
//! - [`CacheError`]: Returned by cache insertion and by
//!   [`StatsCollector::get_shared`](crate::collector::StatsCollector::get_shared)
//!   when the shared collector cannot be placed in (or read back from) the cache.
//! - [`ConfigError`]: Returned when cache configuration parameters are invalid
//!   (e.g. zero shards).
//!
//! ## Example Usage
//!
//! ```
//! use cache_entry_stats::builder::CacheBuilder;
//!
//! let err = CacheBuilder::new(1024).shard_count(0).try_build().unwrap_err();
//! assert!(err.message().contains("shard_count"));
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// CacheError
// ---------------------------------------------------------------------------

/// Error returned when the cache rejects an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The entry does not fit and the cache enforces a strict capacity limit.
    CapacityExceeded {
        /// Charge of the rejected entry.
        charge: usize,
        /// Shard usage at the time of the rejection.
        usage: usize,
        /// Shard capacity.
        capacity: usize,
    },
    /// The cache has been closed and no longer accepts inserts.
    Closed,
    /// The entry found under a collector key holds a value of another type.
    KindMismatch,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::CapacityExceeded {
                charge,
                usage,
                capacity,
            } => write!(
                f,
                "insert of charge {charge} exceeds capacity ({usage}/{capacity} in use)"
            ),
            CacheError::Closed => f.write_str("cache is closed"),
            CacheError::KindMismatch => {
                f.write_str("cache entry under collector key has an unexpected type")
            },
        }
    }
}

impl std::error::Error for CacheError {}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`CacheBuilder::try_build`](crate::builder::CacheBuilder::try_build).
/// Carries a human-readable description of which parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
