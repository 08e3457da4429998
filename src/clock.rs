//! Process-wide monotonic time source.
//!
//! All timer arithmetic is expressed in signed nanoseconds measured from a
//! single anchor captured at first use. This is never wall-clock time: the
//! anchor is an [`Instant`], so suspend/resume and NTP adjustments cannot
//! move deadlines backwards.

use std::time::Instant;

use once_cell::sync::Lazy;

static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed since the anchor was captured.
///
/// The very first call in a process can legitimately return 0; callers that
/// reserve 0 as an "uninitialized" sentinel must substitute their own value.
/// Saturates at `i64::MAX` (roughly 292 years of uptime).
#[inline]
pub(crate) fn now_nanos() -> i64 {
    i64::try_from(ANCHOR.elapsed().as_nanos()).unwrap_or(i64::MAX)
}
