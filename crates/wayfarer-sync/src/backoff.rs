use std::time::Duration;

use rand::RngExt;
use wayfarer_core::config::SyncConfig;

/// Exponential retry schedule with a cap and random jitter.
/// Attempts are unbounded; the delay stops growing at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the base delay added or removed at random (0.0 disables jitter).
    pub jitter: f64,
}

impl Backoff {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms.max(1)),
            max: Duration::from_millis(config.backoff_max_ms.max(config.backoff_initial_ms.max(1))),
            multiplier: config.backoff_multiplier.max(1.0),
            jitter: 0.2,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter.min(1.0);
        let offset = rand::rng().random_range(-spread..=spread);
        let millis = (base.as_millis() as f64 + offset).clamp(0.0, self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}
