//! Time sources for kiln.
//!
//! Every time-sensitive read in the simulator, the cache and the reference
//! scheduler goes through the [`Clock`] trait so that a replay can run against a
//! frozen logical instant instead of the wall clock.
//!
//! # Clocks
//!
//! - [`SystemClock`]: wall-clock milliseconds since the UNIX epoch.
//! - [`SimulatedClock`]: a shared, freezable logical instant. The harness is the only
//!   writer; any number of readers observe the frozen value atomically.
//!
//! # Tiger Style
//!
//! - No `.expect()` or `.unwrap()` - safe fallback to 0
//! - Saturating arithmetic when advancing simulated time
//! - All instants are `u64` milliseconds

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch.
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

// ============================================================================
// Clock Trait
// ============================================================================

/// Injectable source of the current instant, in milliseconds.
///
/// # Example
///
/// ```
/// use kiln_time::{Clock, SimulatedClock};
///
/// fn is_expired(clock: &dyn Clock, expires_at_ms: u64) -> bool {
///     expires_at_ms < clock.now_ms()
/// }
///
/// let clock = SimulatedClock::new(1_000);
/// assert!(!is_expired(&clock, 1_000));
/// clock.freeze(1_001);
/// assert!(is_expired(&clock, 1_000));
/// ```
pub trait Clock: Send + Sync {
    /// Current instant in milliseconds.
    fn now_ms(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

// ============================================================================
// SystemClock (Production)
// ============================================================================

/// Wall clock. Zero-sized; delegates to [`current_time_ms`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        current_time_ms()
    }
}

// ============================================================================
// SimulatedClock (Replay)
// ============================================================================

/// Freezable logical clock shared between the harness and everything it drives.
///
/// Clones share the same instant. Reads never interpolate: they return exactly
/// the last value written by [`freeze`](Self::freeze) or [`bump`](Self::bump).
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    frozen_ms: Arc<AtomicU64>,
}

impl SimulatedClock {
    /// Create a clock frozen at `initial_ms`.
    pub fn new(initial_ms: u64) -> Self {
        Self {
            frozen_ms: Arc::new(AtomicU64::new(initial_ms)),
        }
    }

    /// Freeze the clock at `instant_ms`.
    pub fn freeze(&self, instant_ms: u64) {
        self.frozen_ms.store(instant_ms, Ordering::SeqCst);
    }

    /// Advance the frozen instant by `delta_ms` and return the new instant.
    pub fn bump(&self, delta_ms: u64) -> u64 {
        let mut current = self.frozen_ms.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(delta_ms);
            match self.frozen_ms.compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Clock for SimulatedClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.frozen_ms.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn current_time_ms_reasonable_range() {
        // Should be after year 2020 and before year 2100
        let time = current_time_ms();
        assert!(time > 1_577_836_800_000u64, "current_time_ms {} should be after year 2020", time);
        assert!(time < 4_102_444_800_000u64, "current_time_ms {} should be before year 2100", time);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let t1 = clock.now_ms();
        let t2 = clock.now_ms();
        assert!(t2 >= t1, "time should not go backwards");
    }

    #[test]
    fn simulated_clock_initial_value() {
        let clock = SimulatedClock::new(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn simulated_clock_freeze_overrides() {
        let clock = SimulatedClock::new(0);
        clock.freeze(5_000);
        assert_eq!(clock.now_ms(), 5_000);
        clock.freeze(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn simulated_clock_bump_returns_new_instant() {
        let clock = SimulatedClock::new(100);
        assert_eq!(clock.bump(1), 101);
        assert_eq!(clock.bump(1), 102);
        assert_eq!(clock.now_ms(), 102);
    }

    #[test]
    fn simulated_clock_bump_saturates() {
        let clock = SimulatedClock::new(u64::MAX - 1);
        assert_eq!(clock.bump(10), u64::MAX);
    }

    #[test]
    fn simulated_clock_clone_shares_state() {
        let writer = SimulatedClock::new(0);
        let reader = writer.clone();
        writer.freeze(7);
        assert_eq!(reader.now_ms(), 7);
    }

    #[test]
    fn arc_dyn_clock_delegates() {
        let clock = SimulatedClock::new(9);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        clock.bump(1);
        assert_eq!(shared.now_ms(), 10);
    }

    #[test]
    fn clocks_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SystemClock>();
        assert_send_sync::<SimulatedClock>();
    }

    proptest! {
        #[test]
        fn bumps_accumulate(start in 0u64..1_000_000, deltas in proptest::collection::vec(0u64..1_000, 0..50)) {
            let clock = SimulatedClock::new(start);
            for delta in &deltas {
                clock.bump(*delta);
            }
            prop_assert_eq!(clock.now_ms(), start + deltas.iter().sum::<u64>());
        }
    }
}
