//! Exponential retry backoff with symmetric jitter.
//!
//! `delay = min(base * multiplier^(attempt-1), max)`, then perturbed uniformly
//! within `± jitter_fraction * delay` so concurrent callers retrying the same
//! target do not wake up in lockstep.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;

/// Growth factor used when the policy is derived from [`Config`].
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Values below 1.0 are treated as 1.0 so delays never shrink.
    pub multiplier: f64,
    /// Clamped to [0, 1].
    pub jitter_fraction: f64,
}

/// One computed retry delay. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub base_delay: Duration,
    pub jittered_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_delay: config.retry_delay,
            max_delay: config.max_retry_delay,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_fraction: config.jitter_fraction,
        }
    }

    /// Un-jittered delay for `attempt` (1-based; 0 is treated as 1).
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };
        let secs = self.base_delay.as_secs_f64() * multiplier.powi(exp);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn delay_for(&self, attempt: u32, rng: &mut JitterSource) -> RetryAttempt {
        let base_delay = self.base_delay_for(attempt);
        RetryAttempt {
            attempt_number: attempt.max(1),
            base_delay,
            jittered_delay: apply_jitter(base_delay, self.jitter_fraction, &mut rng.rng),
        }
    }
}

/// Uniform in `[delay * (1 - f), delay * (1 + f))`.
fn apply_jitter(delay: Duration, fraction: f64, rng: &mut impl Rng) -> Duration {
    let fraction = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }

    let offset: f64 = rng.gen_range(-fraction..fraction);
    delay.mul_f64(1.0 + offset)
}

/// Random source for jitter. Seedable so tests are reproducible.
#[derive(Debug, Clone)]
pub struct JitterSource {
    rng: StdRng,
}

impl JitterSource {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for JitterSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}
