//! cache-entry-stats: shared, rate-limited statistics over the entries of a
//! concurrent cache.
//!
//! A [`StatsCollector`](collector::StatsCollector) lives inside the cache it
//! scans, one per statistics kind, so every owner of a shared cache reuses the
//! same (recent) result instead of each walking all entries itself.
//!
//! ## Modules
//!
//! - [`cache`]: the [`Cache`](cache::Cache) trait, handles, and the
//!   [`ShardedCache`](cache::sharded::ShardedCache) implementation
//! - [`collector`]: the stats lifecycle trait and the shared collector
//! - [`stats`]: ready-made statistics kinds
//! - [`clock`]: microsecond time sources
//! - [`builder`]: cache configuration

pub mod builder;
pub mod cache;
pub mod clock;
pub mod collector;
pub mod ds;
pub mod error;
pub mod prelude;
pub mod stats;
