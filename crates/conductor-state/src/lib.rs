//! System state persistence for the Conductor engine.
//!
//! The [`StateStore`] owns the single [`SystemState`](conductor_core::SystemState),
//! keeps a bounded history of snapshots and writes everything through to a
//! pluggable [`StateBackend`].
//!
//! # Main types
//!
//! - [`StateStore`] — Live state, snapshots, agent memory and auto-save.
//! - [`StateBackend`] — Async key/value persistence trait.
//! - [`MemoryBackend`] / [`FileBackend`] — Bundled backends.
//! - [`StateConfig`] — Snapshot retention and auto-save settings.

/// Backend trait and the in-memory backend.
pub mod backend;
/// Store configuration.
pub mod config;
/// JSON-file backend.
pub mod file;
/// The state store.
pub mod store;

pub use backend::{MemoryBackend, StateBackend};
pub use config::StateConfig;
pub use file::FileBackend;
pub use store::{AgentStatePatch, StateStore, SNAPSHOT_INDEX_KEY, SNAPSHOT_KEY_PREFIX, STATE_KEY};

use conductor_core::ConductorResult;
use std::sync::Arc;

/// Build the backend selected by `config`: files under `data_dir` when set,
/// memory otherwise.
pub async fn backend_for(config: &StateConfig) -> ConductorResult<Arc<dyn StateBackend>> {
    Ok(match &config.data_dir {
        Some(dir) => Arc::new(FileBackend::new(dir.clone()).await?),
        None => Arc::new(MemoryBackend::new()),
    })
}
