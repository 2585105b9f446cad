//! Ready-made statistics kinds for [`StatsCollector`](crate::collector::StatsCollector).

pub mod occupancy;

pub use occupancy::OccupancyStats;
