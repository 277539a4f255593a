//! Delivery retry/backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Backoff applied to re-queued deliveries.
///
/// The attempt limit itself is per channel (`config.retry_attempts`), or a
/// rule's `retry` override; this only decides when the next attempt is due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    /// 0.0-1.0, spread applied around the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Retry on the next drain cycle.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            base_delay_ms: ms,
            max_delay_ms: ms,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay_ms == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay_ms as f64;
        let cap = self.max_delay_ms.max(self.base_delay_ms) as f64;
        let delay = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => (base * 2_f64.powi(attempt.min(30) as i32 - 1)).min(cap),
            BackoffStrategy::Linear => (base * attempt as f64).min(cap),
        };

        // Deterministic spread keyed on the attempt number.
        let spread = delay * self.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            let unit = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay + offset).max(0.0) as u64)
    }
}
