use crate::config::BackoffPolicy;
use rand::{
    Rng,
    SeedableRng,
    rngs::StdRng,
};
use std::time::Duration;

const MAX_JITTER_RATIO: f64 = 0.99;

/// Delay schedule for consecutive failed subscription attempts.
///
/// The un-jittered delay doubles per attempt; jitter stays below the next
/// doubling, so delays strictly increase until they reach `max_delay`.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self {
            policy,
            attempts: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt, or `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
        {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempts);
        let delay = self
            .policy
            .base_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay);
        let ratio = self.policy.jitter_ratio.clamp(0.0, MAX_JITTER_RATIO);
        let jitter = if ratio > 0.0 {
            delay.mul_f64(self.rng.random_range(0.0..ratio))
        } else {
            Duration::ZERO
        };
        self.attempts += 1;
        Some((delay + jitter).min(self.policy.max_delay))
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    fn policy(max_attempts: Option<u32>) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_ratio: 0.5,
            max_attempts,
        }
    }

    #[test]
    fn next_delay__strictly_increases_until_cap() {
        // given
        let mut backoff = Backoff::with_seed(policy(None), 7);

        // when
        let delays: Vec<Duration> =
            (0..12).map(|_| backoff.next_delay().unwrap()).collect();

        // then
        let max = Duration::from_secs(5);
        for pair in delays.windows(2) {
            if pair[0] < max {
                assert!(pair[1] > pair[0], "{:?} then {:?}", pair[0], pair[1]);
            } else {
                assert_eq!(pair[1], max);
            }
        }
        assert_eq!(*delays.last().unwrap(), max);
    }

    #[test]
    fn next_delay__stops_after_retry_budget() {
        let mut backoff = Backoff::with_seed(policy(Some(3)), 1);

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());

        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn reset__restarts_from_base_delay() {
        // given
        let mut backoff = Backoff::with_seed(
            BackoffPolicy {
                jitter_ratio: 0.0,
                ..policy(Some(2))
            },
            1,
        );
        backoff.next_delay();
        backoff.next_delay();

        // when
        backoff.reset();

        // then
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }
}
