//! # Retry Scheduling
//!
//! Pure attempt-to-delay calculator shared by the feed drivers. No jitter:
//! the delay sequence is part of the observable reconnect contract.

use std::time::Duration;

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Growth {
    /// `base * factor^attempt`. The WebSocket transport uses factor 2.0,
    /// the event-stream transport 1.5.
    Exponential(f64),
    /// `base * (attempt + 1)`. Used by the polling transport's retry chain.
    Linear,
}

/// Attempt-budgeted delay schedule.
///
/// `attempt` counts failures already observed, starting at 0. Once `attempt`
/// reaches `max_attempts` no further delay is produced and the caller is
/// expected to give up.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    base: Duration,
    growth: Growth,
    max_attempts: u32,
}

impl RetrySchedule {
    /// Exponential schedule with the given factor.
    pub fn exponential(base: Duration, factor: f64, max_attempts: u32) -> Self {
        Self {
            base,
            growth: Growth::Exponential(factor),
            max_attempts,
        }
    }

    /// Linear schedule: 1x, 2x, 3x the base delay.
    pub fn linear(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            growth: Growth::Linear,
            max_attempts,
        }
    }

    /// Delay to wait before attempt number `attempt + 1`, or `None` when the
    /// budget is spent. Delays beyond what `Duration` can hold saturate at
    /// `Duration::MAX`.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let scale = match self.growth {
            Growth::Exponential(factor) => factor.powf(f64::from(attempt)),
            Growth::Linear => f64::from(attempt) + 1.0,
        };
        let seconds = self.base.as_secs_f64() * scale;
        Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
    }

    /// Size of the attempt budget.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_per_attempt() {
        let schedule = RetrySchedule::exponential(Duration::from_secs(1), 2.0, 5);
        assert_eq!(schedule.delay_for(0), Some(Duration::from_secs(1)));
        assert_eq!(schedule.delay_for(1), Some(Duration::from_secs(2)));
        assert_eq!(schedule.delay_for(2), Some(Duration::from_secs(4)));
        assert_eq!(schedule.delay_for(4), Some(Duration::from_secs(16)));
    }

    #[test]
    fn event_stream_factor_grows_slower() {
        let schedule = RetrySchedule::exponential(Duration::from_secs(3), 1.5, 5);
        assert_eq!(schedule.delay_for(0), Some(Duration::from_secs(3)));
        assert_eq!(schedule.delay_for(1), Some(Duration::from_millis(4500)));
        assert_eq!(schedule.delay_for(2), Some(Duration::from_millis(6750)));
    }

    #[test]
    fn linear_multiplies_the_base() {
        let schedule = RetrySchedule::linear(Duration::from_millis(100), 3);
        assert_eq!(schedule.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(schedule.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(schedule.delay_for(2), Some(Duration::from_millis(300)));
    }

    #[test]
    fn budget_cuts_off_at_max_attempts() {
        let schedule = RetrySchedule::exponential(Duration::from_secs(1), 2.0, 3);
        assert!(schedule.delay_for(2).is_some());
        assert_eq!(schedule.delay_for(3), None);
        assert_eq!(schedule.delay_for(100), None);
    }

    #[test]
    fn zero_budget_never_schedules() {
        let schedule = RetrySchedule::linear(Duration::from_secs(1), 0);
        assert_eq!(schedule.delay_for(0), None);
    }

    #[test]
    fn delays_never_shrink() {
        let schedule = RetrySchedule::exponential(Duration::from_millis(250), 1.5, 10);
        let mut previous = Duration::ZERO;
        for attempt in 0..10 {
            let delay = schedule.delay_for(attempt).expect("within budget");
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            previous = delay;
        }
    }

    #[test]
    fn oversized_delays_saturate_instead_of_panicking() {
        let schedule = RetrySchedule::exponential(Duration::from_secs(1), 2.0, u32::MAX);
        assert_eq!(schedule.delay_for(2_000), Some(Duration::MAX));
        assert_eq!(schedule.delay_for(u32::MAX - 1), Some(Duration::MAX));

        let schedule = RetrySchedule::linear(Duration::MAX, u32::MAX);
        assert_eq!(schedule.delay_for(1), Some(Duration::MAX));
    }
}
