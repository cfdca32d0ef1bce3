//! Exponential backoff for delivery retries.

use std::time::Duration;

use rand::Rng;

use crate::config::types::DeliveryConfig;

/// Largest fraction of a delay removed by jitter.
const JITTER_FRACTION: f64 = 0.25;

/// Bounded retry budget with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed per task, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Randomize delays so retries against the destination do not align.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter,
        }
    }

    /// Whether a task with `attempt_count` attempts behind it may try again.
    pub fn allows_another(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Delay before the next attempt, after `attempt_count` failed attempts.
    ///
    /// `base * 2^(n-1)`, capped at `max_delay`. With jitter the result is
    /// scaled down by up to a quarter, so it never exceeds the ceiling.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter {
            let cut = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
            delay.mul_f64(1.0 - cut)
        } else {
            delay
        }
    }
}
