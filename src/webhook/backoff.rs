use std::time::Duration;

use rand::Rng;

use crate::config::WebhookConfig;

/// Exponential backoff with additive jitter.
///
/// The wait before retry `n` (1-based) is `base * 2^(n-1)`, stretched by a
/// random share of up to `jitter_ratio` and capped at `max_delay`. Because
/// the jitter only ever adds, and doubling outgrows any ratio up to 1, the
/// waits never shrink from one retry to the next.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Delay before retry `retry` without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before retry `retry`, jittered.
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(retry);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return nominal;
        }
        let extra = nominal.mul_f64(ratio * rng.gen_range(0.0..1.0));
        (nominal + extra).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WebhookConfig::default())
    }
}
