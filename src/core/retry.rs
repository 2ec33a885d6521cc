//! Shared retry policy.
//!
//! One policy object covers every retried unit of work in the pipeline:
//! download attempts, per-chunk transcription calls, and mailbox polls.
//! Callers classify which of their errors are transient; the policy only
//! decides how many attempts and how long to wait.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy used for external service calls (transcription, analysis)
    pub fn for_service_calls() -> Self {
        Self::default()
    }

    /// Downloads tolerate one more attempt with a shorter initial delay
    pub fn for_downloads() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            ..Self::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sleep out the backoff for the given attempt
    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.delay_for_attempt(attempt)).await;
    }
}
