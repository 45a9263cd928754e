use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages kept in the history ring.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Used by `request_response` when no timeout is given.
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,
}

fn default_history_limit() -> usize {
    1_000
}
fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            default_request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BusConfig {
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}
