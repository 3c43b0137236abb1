use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay curve between connection attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always `base_ms`.
    Fixed,
    /// `base_ms * attempt`.
    #[default]
    Linear,
    /// `base_ms * 2^(attempt - 1)`.
    Exponential,
}

/// Configures the delay between retries of one provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// How delays grow between attempts.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Cap applied to every delay, in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_max_ms() -> u64 {
    8_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps.
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_ms: 0,
            max_ms: 0,
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = u64::from(attempt.max(1));
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.base_ms,
            BackoffStrategy::Linear => self.base_ms.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let exp = u32::try_from(attempt - 1).unwrap_or(u32::MAX).min(63);
                self.base_ms.saturating_mul(2u64.saturating_pow(exp))
            }
        };
        Duration::from_millis(ms.min(self.max_ms))
    }
}
