//! Retry backoff strategies.
//!
//! Each strategy is a pure function from retry count to wait duration. The
//! strategies are a serde-tagged enum rather than closures so persisted
//! workflow definitions deserialize into a concrete, comparable value.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for task retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },
    /// Delay grows linearly with the retry count.
    Linear { delay_ms: u64 },
    /// Delay grows geometrically: `initial * coefficient^retry_count`.
    Exponential {
        initial_ms: u64,
        #[serde(default = "default_exponential_coefficient")]
        coefficient: f64,
    },
    /// Exponential base with a random additive component, spreading
    /// concurrent retries apart: `base = initial * 2^retry_count`,
    /// `delay = base + random[0,1) * coefficient * base`.
    Jitter {
        initial_ms: u64,
        #[serde(default = "default_jitter_coefficient")]
        coefficient: f64,
    },
}

fn default_exponential_coefficient() -> f64 {
    2.0
}

fn default_jitter_coefficient() -> f64 {
    0.5
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed { delay_ms: 1000 }
    }
}

impl BackoffStrategy {
    /// Delay to wait before the attempt following the `retry_count`-th retry.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Linear { delay_ms } => {
                Duration::from_millis(delay_ms.saturating_mul(retry_count as u64))
            }
            BackoffStrategy::Exponential {
                initial_ms,
                coefficient,
            } => {
                let scaled = *initial_ms as f64 * coefficient.powi(retry_count as i32);
                Duration::from_millis(scaled as u64)
            }
            BackoffStrategy::Jitter {
                initial_ms,
                coefficient,
            } => {
                let base = *initial_ms as f64 * 2f64.powi(retry_count as i32);
                // ThreadRng is a CSPRNG, so concurrent executions do not
                // synchronize into retry storms.
                let jitter = rand::random::<f64>() * coefficient * base;
                Duration::from_millis((base + jitter) as u64)
            }
        }
    }
}
