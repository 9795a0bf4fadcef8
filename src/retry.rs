//! Reconnect backoff.
//!
//! Request-level retries are deliberately restricted (only MOVED/ASK
//! redirections re-dispatch a request); this module only paces the
//! connection-level reconnect loop.

use crate::config::ReconnectStrategy;
use std::time::Duration;

/// Tracks reconnect attempts for one node. The schedule is deterministic so
/// operators can reason about reconnect storms; the counter resets when a
/// connection reaches Ready.
#[derive(Debug, Clone)]
pub struct Backoff {
    strategy: ReconnectStrategy,
    attempt: u32,
}

impl Backoff {
    pub fn new(strategy: ReconnectStrategy) -> Self {
        Backoff {
            strategy,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the attempts allowed by
    /// the strategy are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.strategy.number_of_retries {
            return None;
        }
        let delay = delay_for_attempt(&self.strategy, self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }

    /// A successful Ready transition restarts the schedule.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn delay_for_attempt(strategy: &ReconnectStrategy, attempt: u32) -> Duration {
    let exponent = (strategy.exponent_base as u64).saturating_pow(attempt);
    let millis = strategy
        .base_ms
        .saturating_mul(strategy.factor as u64)
        .saturating_mul(exponent)
        .min(strategy.max_ms);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(retries: u32) -> ReconnectStrategy {
        ReconnectStrategy {
            number_of_retries: retries,
            factor: 2,
            exponent_base: 2,
            base_ms: 100,
            max_ms: 30_000,
        }
    }

    #[test]
    fn schedule_doubles_per_attempt() {
        let mut backoff = Backoff::new(strategy(3));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(800)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts_made(), 3);
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(strategy(2));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn delays_are_capped() {
        let mut backoff = Backoff::new(ReconnectStrategy {
            number_of_retries: 50,
            factor: 2,
            exponent_base: 2,
            base_ms: 100,
            max_ms: 1_000,
        });
        let last = std::iter::from_fn(|| backoff.next_delay()).last().unwrap();
        assert_eq!(last, Duration::from_millis(1_000));
    }
}
