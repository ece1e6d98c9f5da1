//! Bounded exponential backoff.
//!
//! Both the wait between attempts and the per-attempt timeout double each
//! round, each up to its own cap.

use std::time::Duration;

use crate::config::BackoffConfig;

const MAX_JITTER_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based.
    pub number: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            jitter: true,
        }
    }

    /// Exact delays, for deterministic schedules.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// The next attempt, or `None` once the budget is spent.
    pub fn next_attempt(&mut self) -> Option<Attempt> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(Attempt {
            number: self.attempt,
            timeout: doubled(self.config.base_timeout, self.attempt - 1, self.config.max_timeout),
        })
    }

    /// Wait before the attempt after the current one.
    pub fn delay(&self) -> Duration {
        let delay = doubled(
            self.config.base_delay,
            self.attempt.saturating_sub(1),
            self.config.max_delay,
        );
        if self.jitter {
            delay + Duration::from_millis(rand::random::<u64>() % MAX_JITTER_MS)
        } else {
            delay
        }
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }
}

fn doubled(base: Duration, doublings: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(doublings.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_doubles_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig::default()).without_jitter();
        let mut timeouts = Vec::new();
        let mut delays = Vec::new();

        while let Some(attempt) = backoff.next_attempt() {
            timeouts.push(attempt.timeout.as_secs());
            delays.push(backoff.delay().as_millis() as u64);
        }

        assert_eq!(timeouts, vec![2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 16000, 32000]);
        assert!(backoff.exhausted());
        assert_eq!(backoff.next_attempt(), None);
    }

    #[test]
    fn test_jitter_stays_small() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_attempt();
        let delay = backoff.delay();
        assert!(delay >= Duration::from_millis(500));
        assert!(delay < Duration::from_millis(550));
    }
}
