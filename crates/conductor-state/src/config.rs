use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// State store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Snapshots kept in history; the oldest are evicted first.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Lifetime of a persisted snapshot.
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,
    #[serde(default = "default_auto_save_interval_secs")]
    pub auto_save_interval_secs: u64,
    /// Directory of the file backend. `None` keeps state in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_max_snapshots() -> usize {
    50
}
fn default_snapshot_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}
fn default_auto_save_interval_secs() -> u64 {
    30
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
            auto_save_interval_secs: default_auto_save_interval_secs(),
            data_dir: None,
        }
    }
}

impl StateConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs.max(1))
    }
}
