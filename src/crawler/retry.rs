//! Retry decisions and backoff for failed units
//!
//! A unit may be attempted `retry_budget + 1` times. The delay before the
//! next attempt grows geometrically from the base delay, is capped, and gets
//! a little random jitter so retries of many units do not line up.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// What happens to a unit after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the unit once `delay` has passed
    Retry { delay: Duration },
    /// Budget spent; the unit fails permanently
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Decides whether a unit gets another attempt
    ///
    /// # Arguments
    ///
    /// * `attempts` - Attempts made so far, including the one that just failed
    /// * `budget` - The job's retry budget
    pub fn decide(&self, attempts: u32, budget: u32) -> RetryDecision {
        if attempts <= budget {
            RetryDecision::Retry {
                delay: self.backoff(attempts),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Delay before the attempt that follows attempt number `attempts`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30) as i32;
        let scaled = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_millis() as f64);

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        Duration::from_millis(capped.round() as u64) + jitter
    }
}
