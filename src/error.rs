//! Error types surfaced by the timer facade.
//!
//! Construction-time validation failures, submission back-pressure, and
//! lifecycle misuse all surface synchronously through [`TimerError`]. Task
//! panics are deliberately absent here: they are contained on the worker
//! thread and logged, never propagated to submitters.

use thiserror::Error;

/// Errors returned by timer construction, submission, and shutdown.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The configured tick duration was zero.
    #[error("tick_duration must be greater than 0")]
    InvalidTickDuration,

    /// The configured wheel size was zero.
    #[error("ticks_per_wheel must be greater than 0: {0}")]
    InvalidTicksPerWheel(usize),

    /// The configured wheel size exceeded the 2^30 slot cap.
    #[error("ticks_per_wheel may not be greater than 2^30: {0}")]
    WheelTooLarge(usize),

    /// One full wheel revolution would not fit in the clock range.
    #[error(
        "tick_duration of {tick_nanos} ns with {wheel_len} slots exceeds the \
         representable time range"
    )]
    TickDurationOverflow { tick_nanos: i64, wheel_len: usize },

    /// Submission rejected: the pending-timeout cap was reached.
    #[error(
        "number of pending timeouts ({pending}) is greater than the maximum \
         allowed pending timeouts ({max})"
    )]
    Rejected { pending: u64, max: i64 },

    /// The timer was already stopped and cannot be started again.
    #[error("cannot be started once stopped")]
    ShutDown,

    /// `stop()` was invoked on the worker thread (i.e. from inside a task).
    #[error("stop() cannot be called from the timer worker thread")]
    StopFromWorker,

    /// The thread factory failed to spawn the worker thread.
    #[error("failed to spawn the worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_values() {
        let err = TimerError::Rejected {
            pending: 4,
            max: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains('4'));
        assert!(msg.contains('3'));

        let err = TimerError::WheelTooLarge(1 << 31);
        assert!(err.to_string().contains("2^30"));
    }
}
