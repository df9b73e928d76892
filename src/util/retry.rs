use rand::{thread_rng, Rng};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

/// Backoff schedule used when opening transport channels.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
    skip_first_delay: bool,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
            skip_first_delay: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay).filter(|delay| !delay.is_zero());
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_skip_first_delay(mut self, skip: bool) -> Self {
        self.skip_first_delay = skip;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() || (self.skip_first_delay && attempt == 1) {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(31) as u32;
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let factor =
            thread_rng().gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        bounded.mul_f64(factor)
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_policy_skips_first_delay_and_stops_at_budget() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(10)).with_skip_first_delay(true);
        let mut handle = policy.handle();
        assert_eq!(handle.next_delay(), Some(Duration::ZERO));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(handle.next_delay(), None);
        assert_eq!(handle.attempts(), 2);
    }

    #[test]
    fn exponential_policy_respects_cap() {
        let policy = RetryPolicy::exponential(6, Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(35));
        let mut handle = policy.handle();
        let delays: Vec<_> = std::iter::from_fn(|| handle.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(35),
                Duration::from_millis(35),
                Duration::from_millis(35),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = RetryPolicy::linear(2, Duration::from_millis(100)).with_jitter(0.5);
        for _ in 0..32 {
            let delay = policy.handle().next_delay().unwrap();
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
    }
}
