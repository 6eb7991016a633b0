//! Clock abstraction for wall-clock vs simulated time.
//!
//! Series and session deadlines are checked between commands against a
//! [`Clock`]. Production runs use [`SystemClock`]; deterministic runs use a
//! [`SimClock`] that only moves when the simulated device advances it.
//!
//! ```rust,ignore
//! let clock = SimClock::new();
//! let device = SimTpm::new(config).with_clock(clock.clone());
//! let tpm = Tpm::new(device, Arc::new(clock));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic time in nanoseconds.
pub trait Clock: Send + Sync {
    /// Returns nanoseconds elapsed since the clock's origin.
    fn now(&self) -> u64;

    /// Returns milliseconds elapsed since the clock's origin.
    #[inline]
    fn now_ms(&self) -> u64 {
        self.now() / 1_000_000
    }
}

// ============================================================================
// Simulation Implementation
// ============================================================================

/// Shared simulated clock.
///
/// Clones observe the same time, so the device can advance the clock the
/// session driver reads.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now_ns: Arc<AtomicU64>,
}

impl SimClock {
    /// Creates a clock starting at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock starting at the given time.
    pub fn at(now_ns: u64) -> Self {
        Self {
            now_ns: Arc::new(AtomicU64::new(now_ns)),
        }
    }

    /// Advances every clone of this clock by `delta_ns`.
    pub fn advance(&self, delta_ns: u64) {
        self.now_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }
}

impl Clock for SimClock {
    #[inline]
    fn now(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Wall-clock time anchored at construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}
