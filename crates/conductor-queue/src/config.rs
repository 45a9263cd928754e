use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs of a [`WorkQueue`](crate::WorkQueue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Jobs executing at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Total executions allowed per job, first attempt included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// An execution running longer than this is reported stalled.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    /// Completed (and cancelled) jobs kept for inspection.
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,
    /// Failed jobs kept for manual retry.
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,
}

fn default_concurrency() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_job_timeout_ms() -> u64 {
    300_000
}
fn default_keep_completed() -> usize {
    100
}
fn default_keep_failed() -> usize {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
        }
    }
}

impl QueueConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Delay before retrying after the given failed attempt (1-based):
    /// `base × 2^(attempt-1)`, capped at `backoff_max_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub(crate) fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}
