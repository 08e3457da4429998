//! Timer configuration and construction-time validation.
//!
//! All options are fixed at construction; there is no mutable configuration.
//! Validation is strict about sizes (a full wheel revolution must fit in the
//! signed 64-bit nanosecond range) but forgiving about granularity: ticks
//! shorter than a millisecond are clamped up with a warning rather than
//! rejected, because the wheel cannot deliver sub-millisecond accuracy
//! anyway.

use std::time::Duration;

use tracing::warn;

use crate::error::TimerError;

/// Hard cap on wheel slots. Requests above this are rejected outright.
pub const MAX_TICKS_PER_WHEEL: usize = 1 << 30;

pub(crate) const MILLISECOND_NANOS: i64 = 1_000_000;

/// Construction-time timer options.
///
/// Defaults match the common I/O-timeout use case: a 100 ms tick, a 512-slot
/// wheel, leak detection enabled, and no pending-timeout cap.
///
/// | Option                 | Effect                                             |
/// |------------------------|----------------------------------------------------|
/// | `tick_duration`        | Scheduling granularity; clamped up to 1 ms.        |
/// | `ticks_per_wheel`      | Rounded up to a power of two, capped at 2^30.      |
/// | `leak_detection`       | If false, tracked only for non-daemon workers.     |
/// | `max_pending_timeouts` | <= 0 means unbounded; otherwise submissions past   |
/// |                        | the cap are rejected.                              |
#[derive(Clone, Copy, Debug)]
pub struct TimerConfig {
    /// Interval between wheel advances.
    pub tick_duration: Duration,

    /// Requested number of wheel slots.
    pub ticks_per_wheel: usize,

    /// Track this instance with the leak hook even for daemon workers.
    pub leak_detection: bool,

    /// Back-pressure cap on accepted-but-unfired submissions; `<= 0` is
    /// unbounded.
    pub max_pending_timeouts: i64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(100),
            ticks_per_wheel: 512,
            leak_detection: true,
            max_pending_timeouts: -1,
        }
    }
}

impl TimerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// - `InvalidTickDuration` if `tick_duration` is zero.
    /// - `InvalidTicksPerWheel` / `WheelTooLarge` for bad wheel sizes.
    /// - `TickDurationOverflow` if `tick_duration * wheel_len` would not fit
    ///   in an `i64` of nanoseconds. Checked against the requested (pre-clamp)
    ///   duration.
    pub fn validate(&self) -> Result<(), TimerError> {
        if self.tick_duration.is_zero() {
            return Err(TimerError::InvalidTickDuration);
        }
        if self.ticks_per_wheel == 0 {
            return Err(TimerError::InvalidTicksPerWheel(self.ticks_per_wheel));
        }
        if self.ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            return Err(TimerError::WheelTooLarge(self.ticks_per_wheel));
        }

        let wheel_len = self.wheel_len();
        let tick_nanos = duration_nanos(self.tick_duration);
        if tick_nanos >= i64::MAX / wheel_len as i64 {
            return Err(TimerError::TickDurationOverflow {
                tick_nanos,
                wheel_len,
            });
        }

        Ok(())
    }

    /// Normalized wheel length: smallest power of two >= `ticks_per_wheel`.
    pub(crate) fn wheel_len(&self) -> usize {
        debug_assert!(self.ticks_per_wheel > 0);
        debug_assert!(self.ticks_per_wheel <= MAX_TICKS_PER_WHEEL);
        self.ticks_per_wheel.next_power_of_two()
    }

    /// Effective tick duration in nanoseconds, clamped up to 1 ms.
    pub(crate) fn tick_nanos(&self) -> i64 {
        let nanos = duration_nanos(self.tick_duration);
        if nanos < MILLISECOND_NANOS {
            warn!(
                requested_nanos = nanos,
                "configured tick_duration is smaller than 1 ms, using 1 ms"
            );
            MILLISECOND_NANOS
        } else {
            nanos
        }
    }
}

/// Duration to signed nanoseconds, saturating at `i64::MAX`.
#[inline]
pub(crate) fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}


#[cfg(all(test, feature = "timer-proptest"))]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    const PROPTEST_CASES: u32 = 64;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(PROPTEST_CASES))]

        /// The normalized wheel is always a power of two, at least as large
        /// as the request, and no more than twice it.
        #[test]
        fn wheel_len_normalization(requested in 1usize..=MAX_TICKS_PER_WHEEL) {
            let cfg = TimerConfig {
                ticks_per_wheel: requested,
                ..TimerConfig::default()
            };
            let len = cfg.wheel_len();

            prop_assert!(len.is_power_of_two());
            prop_assert!(len >= requested);
            prop_assert!(len < requested.saturating_mul(2).max(2));
        }

        /// Every accepted configuration has a revolution that fits in i64
        /// nanoseconds with the effective (clamped) tick.
        #[test]
        fn accepted_configs_fit_clock_range(
            tick_ms in 1u64..10_000,
            requested in 1usize..=1 << 20,
        ) {
            let cfg = TimerConfig {
                tick_duration: Duration::from_millis(tick_ms),
                ticks_per_wheel: requested,
                ..TimerConfig::default()
            };
            if cfg.validate().is_ok() {
                let product = cfg
                    .tick_nanos()
                    .checked_mul(cfg.wheel_len() as i64);
                prop_assert!(product.is_some());
            }
        }
    }
}
