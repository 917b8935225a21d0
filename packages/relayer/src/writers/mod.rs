//! Destination-chain transaction writers
//!
//! [`VoteSubmitter`] casts this relayer's vote, [`Executor`] finalizes
//! passed proposals. Both retry transient connector errors with the shared
//! [`RetryConfig`] backoff and leave cross-relayer deduplication to the chain.

pub mod execute;
pub mod retry;
pub mod vote;

pub use execute::{ExecutionOutcome, Executor};
pub use retry::RetryConfig;
pub use vote::{SubmissionOutcome, VoteSubmitter};

/// Counts consecutive failures of one component and reports when the
/// threshold is crossed or the component recovers.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
}

/// State change produced by a [`CircuitBreaker`] observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Tripped,
    Recovered,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    pub fn record_failure(&mut self) -> Option<BreakerTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        (self.consecutive_failures == self.threshold).then_some(BreakerTransition::Tripped)
    }

    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        let was_open = self.is_open();
        self.consecutive_failures = 0;
        was_open.then_some(BreakerTransition::Recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_trips_once_and_recovers() {
        let mut breaker = CircuitBreaker::new(3);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), Some(BreakerTransition::Tripped));
        assert_eq!(breaker.record_failure(), None);
        assert!(breaker.is_open());

        assert_eq!(breaker.record_success(), Some(BreakerTransition::Recovered));
        assert_eq!(breaker.record_success(), None);
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
