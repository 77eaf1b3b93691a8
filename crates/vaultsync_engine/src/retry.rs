//! Bounded exponential backoff with jitter.
//!
//! The scheduler performs no I/O. It returns a delay; callers sleep and
//! re-invoke the underlying send themselves.

use crate::config::RetryConfig;
use std::time::Duration;

/// Delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Wait this long, then retry.
    Bounded(Duration),
    /// Do not retry in-process; the error is not transient.
    Unbounded,
}

impl Delay {
    /// Returns true for the unbounded delay.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Delay::Unbounded)
    }

    /// Returns the duration of a bounded delay.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Delay::Bounded(d) => Some(*d),
            Delay::Unbounded => None,
        }
    }
}

/// Retry state threaded explicitly through a send pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// 1-based attempt counter.
    pub attempt: u32,
}

impl RetryState {
    /// Creates the state for the first attempt.
    pub fn new() -> Self {
        Self { attempt: 1 }
    }

    /// Returns the state for the following attempt.
    pub fn next(self) -> Self {
        Self {
            attempt: self.attempt + 1,
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes backoff delays from an attempt counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
}

impl Backoff {
    /// Creates a backoff with the given base unit.
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// Exponential factor for an attempt: `round((attempt mod 7) ^ e)`.
    fn exponential(attempt: u32) -> f64 {
        f64::from(attempt % 7).powf(std::f64::consts::E).round()
    }

    /// Computes the delay for an attempt.
    ///
    /// `round((attempt mod 7) ^ e) * base − jitter`, where the jitter is a
    /// random fraction of `base / 4` scaled by the same exponential
    /// factor. Attempts that are multiples of 7 wrap back to zero delay.
    pub fn compute(&self, attempt: u32) -> Duration {
        let exponential = Self::exponential(attempt);
        let base_ms = self.base.as_millis() as f64;
        let jitter = rand::random::<f64>() * exponential * (base_ms / 4.0);
        let delay_ms = (exponential * base_ms - jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// Computes the delay for an attempt, escalating to [`Delay::Unbounded`]
    /// once `attempt > 6` when the caller indicates the error is not
    /// transient.
    pub fn incremental(&self, state: RetryState, finite: bool) -> Delay {
        if !finite && state.attempt > 6 {
            return Delay::Unbounded;
        }
        Delay::Bounded(self.compute(state.attempt))
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Backoff::new(config.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1000))
    }

    #[test]
    fn zero_attempt_is_zero_delay() {
        assert_eq!(backoff().compute(0), Duration::ZERO);
        assert_eq!(backoff().compute(7), Duration::ZERO);
        assert_eq!(backoff().compute(14), Duration::ZERO);
    }

    #[test]
    fn first_attempt_close_to_base() {
        // exponential factor for attempt 1 is 1: base minus up to base/4
        let delay = backoff().compute(1);
        assert!(delay <= Duration::from_millis(1000));
        assert!(delay >= Duration::from_millis(750));
    }

    #[test]
    fn unbounded_after_six_when_not_finite() {
        let b = backoff();
        assert!(!b.incremental(RetryState { attempt: 6 }, false).is_unbounded());
        assert!(b.incremental(RetryState { attempt: 7 }, false).is_unbounded());
        // finite callers never escalate
        assert!(!b.incremental(RetryState { attempt: 7 }, true).is_unbounded());
    }

    #[test]
    fn retry_state_advances() {
        let state = RetryState::new();
        assert_eq!(state.attempt, 1);
        assert_eq!(state.next().attempt, 2);
        assert_eq!(state.next().next().attempt, 3);
    }

    proptest! {
        // delays for attempts 1..=6 never exceed pow(6, e) * base
        #[test]
        fn bounded_by_sixth_power(attempt in 1u32..=6) {
            let base_ms = 1000.0;
            let ceiling = 6f64.powf(std::f64::consts::E).round() * base_ms;
            let delay = backoff().compute(attempt);
            prop_assert!((delay.as_millis() as f64) <= ceiling);
        }

        // jitter never produces a negative delay
        #[test]
        fn never_negative(attempt in 0u32..100) {
            let delay = backoff().compute(attempt);
            prop_assert!(delay >= Duration::ZERO);
        }
    }
}
