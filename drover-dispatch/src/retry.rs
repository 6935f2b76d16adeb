//! Retry policy with exponential backoff and jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for transient dispatch failures.
///
/// The deferral delay is `base * 2^retry_count`, capped at `max_delay_secs`,
/// then randomized within `±jitter_factor` so synchronized failures do not
/// retry in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry deferrals before a message fails permanently.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (in seconds).
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Cap on the backoff delay (in seconds).
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,

    /// Jitter factor applied to the delay (e.g. 0.1 for ±10%).
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        5
    }

    pub const fn base_delay_secs() -> u64 {
        60
    }

    pub const fn max_delay_secs() -> u64 {
        86400 // 24 hours
    }

    pub const fn jitter_factor() -> f64 {
        0.1
    }
}

impl RetryPolicy {
    /// Deferral delay for a message that has already been retried
    /// `retry_count` times
    #[must_use]
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        // Saturating shift so a large retry_count cannot overflow
        let delay = if retry_count >= 63 {
            self.max_delay_secs
        } else {
            self.base_delay_secs
                .saturating_mul(1_u64 << retry_count)
                .min(self.max_delay_secs)
        };

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let jitter_range = (delay as f64) * self.jitter_factor;
            if jitter_range > 0.0 {
                let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
                ((delay as f64) + jitter).max(0.0) as u64
            } else {
                delay
            }
        };

        Duration::from_secs(jittered)
    }
}
