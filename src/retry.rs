//! Retry backoff.
//!
//! A failed attempt that still has retry budget is re-queued with
//! `scheduled_at = now + delay(attempts)`. The default policy reproduces plain
//! exponential backoff of `2^attempts` seconds (2s, 4s, 8s, ...). A cap and
//! jitter can be configured; jitter changes observable retry timing, so it is
//! off unless asked for.
//!
//! ```rust
//! use jobkeeper::retry::{BackoffPolicy, JitterType};
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::default();
//! assert_eq!(policy.delay(1), Duration::from_secs(2));
//! assert_eq!(policy.delay(3), Duration::from_secs(8));
//!
//! let capped = BackoffPolicy::default()
//!     .with_max_delay(Duration::from_secs(60))
//!     .with_jitter(JitterType::Multiplicative(0.1));
//! assert!(capped.delay(10) <= Duration::from_secs(66));
//! ```

use crate::config::{duration_secs, option_duration_secs};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ceiling for a policy with no `max_delay`: the largest span
/// `chrono::Duration` can represent.
pub const UNCAPPED_DELAY: Duration = Duration::from_millis(i64::MAX as u64);

/// Random spread applied to a computed delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JitterType {
    /// `delay ± rand(0, amount)`
    Additive(Duration),

    /// `delay * (1 ± rand(0, factor))`; 0.1 keeps the result within ±10%.
    Multiplicative(f64),
}

impl JitterType {
    /// Applies jitter to `delay`. The result never goes below zero.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(jitter_amount) => {
                let jitter_millis = rng.gen_range(0..=jitter_amount.as_millis() as u64);
                let jitter = Duration::from_millis(jitter_millis);

                if rng.gen_bool(0.5) {
                    delay + jitter
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.abs().min(1.0);
                let jitter_factor = rng.gen_range((1.0 - factor)..=(1.0 + factor));
                let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
                Duration::from_millis(jittered_millis)
            }
        }
    }
}

/// Exponential backoff: `base * multiplier^attempts`, optionally capped and
/// jittered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    #[serde(with = "duration_secs")]
    pub base: Duration,
    pub multiplier: f64,
    #[serde(default, with = "option_duration_secs")]
    pub max_delay: Option<Duration>,
    #[serde(default)]
    pub jitter: Option<JitterType>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: None,
            jitter: None,
        }
    }
}

impl BackoffPolicy {
    pub fn exponential(base: Duration, multiplier: f64) -> Self {
        Self {
            base,
            multiplier,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: JitterType) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Delay before the next attempt, given the number of attempts made so far.
    ///
    /// Without `max_delay` the delay keeps doubling until it reaches
    /// [`UNCAPPED_DELAY`], the longest span a job's `scheduled_at` can hold.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(0.0).powi(exponent);

        // Duration::mul_f64 panics on overflow; saturate instead
        let ceiling = self.max_delay.unwrap_or(UNCAPPED_DELAY);
        let raw_secs = self.base.as_secs_f64() * factor;
        let delay = if raw_secs.is_finite() && raw_secs < ceiling.as_secs_f64() {
            Duration::from_secs_f64(raw_secs)
        } else {
            ceiling
        };

        match &self.jitter {
            Some(jitter) => jitter.apply(delay),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_two_to_the_attempts() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
    }

    #[test]
    fn test_custom_base_and_multiplier() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(500), 3.0);
        assert_eq!(policy.delay(1), Duration::from_millis(1500));
        assert_eq!(policy.delay(2), Duration::from_millis(4500));
    }

    #[test]
    fn test_max_delay_caps_growth() {
        let policy = BackoffPolicy::default().with_max_delay(Duration::from_secs(30));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(500), Duration::from_secs(30));
    }

    #[test]
    fn test_huge_attempt_counts_do_not_panic() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(u32::MAX), UNCAPPED_DELAY);
        assert_eq!(policy.delay(1_000), UNCAPPED_DELAY);
    }

    #[test]
    fn test_no_cap_without_max_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(17), Duration::from_secs(131_072));
        assert_eq!(policy.delay(20), Duration::from_secs(1_048_576));
    }

    #[test]
    fn test_additive_jitter_bounds() {
        let jitter = JitterType::Additive(Duration::from_secs(5));
        for _ in 0..50 {
            let jittered = jitter.apply(Duration::from_secs(30));
            assert!(jittered >= Duration::from_secs(25));
            assert!(jittered <= Duration::from_secs(35));
        }
    }

    #[test]
    fn test_multiplicative_jitter_bounds() {
        let policy = BackoffPolicy::default().with_jitter(JitterType::Multiplicative(0.2));
        for _ in 0..50 {
            let delay = policy.delay(3);
            assert!(delay >= Duration::from_millis(6400));
            assert!(delay <= Duration::from_millis(9600));
        }
    }

    #[test]
    fn test_serialization() {
        let policy = BackoffPolicy::default().with_max_delay(Duration::from_secs(300));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["base"], "1s");
        assert_eq!(json["max_delay"], "5m");

        let back: BackoffPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
