//! Microsecond clocks used to timestamp collection passes.
//!
//! [`SystemClock`] is the only time source the collector reads. Two
//! implementations ship with the crate:
//!
//! - [`DefaultClock`]: wall-clock microseconds since the UNIX epoch, clamped so
//!   readings never go backwards.
//! - [`ManualClock`]: a clock that only moves when told to, for tests and
//!   simulations.
//!
//! ## Example Usage
//!
//! ```
//! use cache_entry_stats::clock::{ManualClock, SystemClock};
//!
//! let clock = ManualClock::new(0);
//! clock.advance_micros(500_000);
//! assert_eq!(clock.now_micros(), 500_000);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of monotonic microsecond timestamps.
pub trait SystemClock: Send + Sync {
    /// Current time in microseconds.
    fn now_micros(&self) -> u64;
}

/// Wall-clock time in microseconds since the UNIX epoch.
///
/// Readings are clamped to a high-water mark, so a wall-clock step backwards
/// shows up as time standing still rather than running in reverse.
#[derive(Debug, Default)]
pub struct DefaultClock {
    high_water: AtomicU64,
}

impl DefaultClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SystemClock for DefaultClock {
    fn now_micros(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let previous = self.high_water.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }
}

/// Clock that advances only when explicitly moved.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start_micros`.
    pub fn new(start_micros: u64) -> Self {
        Self {
            now: AtomicU64::new(start_micros),
        }
    }

    /// Moves the clock forward by `delta_micros`.
    pub fn advance_micros(&self, delta_micros: u64) {
        self.now.fetch_add(delta_micros, Ordering::AcqRel);
    }

    /// Sets the clock to an absolute reading.
    pub fn set_micros(&self, now_micros: u64) {
        self.now.store(now_micros, Ordering::Release);
    }
}

impl SystemClock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
