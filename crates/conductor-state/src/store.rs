use crate::backend::StateBackend;
use crate::config::StateConfig;
use chrono::Utc;
use conductor_core::{
    AgentMetrics, AgentRole, AgentRuntimeState, AgentStatus, ConductorError, ConductorResult,
    EngineEvent, EventHub, MemoryTier, Phase, Snapshot, SnapshotId, SystemState, TaskId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backend key of the live state.
pub const STATE_KEY: &str = "conductor:state";
/// Backend key prefix of individual snapshots.
pub const SNAPSHOT_KEY_PREFIX: &str = "conductor:snapshot:";
/// Backend key of the ordered snapshot id index.
pub const SNAPSHOT_INDEX_KEY: &str = "conductor:snapshots";

fn snapshot_key(id: SnapshotId) -> String {
    format!("{SNAPSHOT_KEY_PREFIX}{id}")
}

/// Partial update of an agent's runtime state. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatePatch {
    #[serde(default)]
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub current_tasks: Option<Vec<TaskId>>,
    #[serde(default)]
    pub metrics: Option<AgentMetrics>,
}

impl AgentStatePatch {
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    fn apply(self, agent: &mut AgentRuntimeState) {
        if let Some(status) = self.status {
            agent.status = status;
        }
        if let Some(tasks) = self.current_tasks {
            agent.current_tasks = tasks;
        }
        if let Some(metrics) = self.metrics {
            agent.metrics = metrics;
        }
    }
}

/// Owner of the [`SystemState`].
///
/// The in-memory copy is authoritative. Every mutation is written through
/// to the backend; a failed write is logged and the call still succeeds.
/// Readers always receive copies.
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    config: StateConfig,
    hub: Option<EventHub>,
    state: RwLock<SystemState>,
    /// Oldest first.
    history: RwLock<VecDeque<Snapshot>>,
    /// Held across serialize and write so saves land in order.
    save_lock: Mutex<()>,
}

impl StateStore {
    /// Load persisted state and snapshot history, or start fresh.
    pub async fn open(backend: Arc<dyn StateBackend>, config: StateConfig) -> ConductorResult<Self> {
        let (state, fresh) = match backend.get(STATE_KEY).await? {
            Some(value) => {
                let mut state: SystemState = serde_json::from_value(value)
                    .map_err(|e| ConductorError::Storage(format!("Corrupt system state: {e}")))?;
                let added = state.ensure_roster();
                if added > 0 {
                    warn!(added, "Persisted state was missing roster agents");
                }
                (state, false)
            }
            None => (SystemState::new(), true),
        };

        let ids: Vec<SnapshotId> = match backend.get(SNAPSHOT_INDEX_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| ConductorError::Storage(format!("Corrupt snapshot index: {e}")))?,
            None => Vec::new(),
        };
        let mut history = VecDeque::with_capacity(ids.len());
        for id in ids {
            match backend.get(&snapshot_key(id)).await? {
                Some(value) => match serde_json::from_value::<Snapshot>(value) {
                    Ok(mut snapshot) => {
                        snapshot.state.ensure_roster();
                        history.push_back(snapshot);
                    }
                    Err(e) => warn!(snapshot_id = %id, error = %e, "Skipping corrupt snapshot"),
                },
                None => debug!(snapshot_id = %id, "Snapshot expired"),
            }
        }
        while history.len() > config.max_snapshots {
            history.pop_front();
        }

        info!(
            backend = backend.name(),
            phase = %state.phase,
            snapshots = history.len(),
            fresh,
            "State store opened"
        );
        let store = Self {
            backend,
            config,
            hub: None,
            state: RwLock::new(state),
            history: RwLock::new(history),
            save_lock: Mutex::new(()),
        };
        if fresh {
            store.persist_state().await;
        }
        Ok(store)
    }

    /// Publish snapshot events on `hub`.
    pub fn with_event_hub(mut self, hub: EventHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    pub async fn get_system_state(&self) -> SystemState {
        self.state.read().await.clone()
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase
    }

    pub async fn get_agent_state(&self, role: AgentRole) -> AgentRuntimeState {
        self.state
            .read()
            .await
            .agent(role)
            .cloned()
            .unwrap_or_else(|| AgentRuntimeState::new(role))
    }

    /// Apply `f` to the whole state and persist.
    pub async fn modify<R>(&self, f: impl FnOnce(&mut SystemState) -> R) -> R {
        let out = {
            let mut state = self.state.write().await;
            let out = f(&mut *state);
            state.touch();
            out
        };
        self.persist_state().await;
        out
    }

    /// Apply `f` to one agent's runtime state and persist.
    pub async fn modify_agent<R>(
        &self,
        role: AgentRole,
        f: impl FnOnce(&mut AgentRuntimeState) -> R,
    ) -> R {
        self.modify(|state| {
            let agent = state
                .agents
                .entry(role)
                .or_insert_with(|| AgentRuntimeState::new(role));
            let out = f(agent);
            agent.last_active = Utc::now();
            out
        })
        .await
    }

    pub async fn update_agent_state(&self, role: AgentRole, patch: AgentStatePatch) {
        self.modify_agent(role, |agent| patch.apply(agent)).await;
    }

    pub async fn update_global_context(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.modify(|state| {
            state.global_context.insert(key, value);
        })
        .await;
    }

    pub async fn get_global_context(&self, key: &str) -> Option<serde_json::Value> {
        self.state.read().await.global_context.get(key).cloned()
    }

    /// Snapshot the current state, then switch phase.
    pub async fn set_phase(&self, phase: Phase) -> SnapshotId {
        let from = self.phase().await;
        let snapshot_id = self
            .create_snapshot(format!("phase transition {from} -> {phase}"))
            .await;
        self.modify(|state| state.phase = phase).await;
        snapshot_id
    }

    pub async fn set_active_agents(&self, roles: BTreeSet<AgentRole>) {
        self.modify(|state| state.active_agents = roles).await;
    }

    pub async fn active_agents(&self) -> BTreeSet<AgentRole> {
        self.state.read().await.active_agents.clone()
    }

    pub async fn create_snapshot(&self, reason: impl Into<String>) -> SnapshotId {
        let snapshot = Snapshot::capture(&*self.state.read().await, reason);
        let id = snapshot.id;
        let reason = snapshot.reason.clone();
        let value = serde_json::to_value(&snapshot);

        let (evicted, index) = {
            let mut history = self.history.write().await;
            history.push_back(snapshot);
            let mut evicted = Vec::new();
            while history.len() > self.config.max_snapshots {
                if let Some(old) = history.pop_front() {
                    evicted.push(old.id);
                }
            }
            let index: Vec<SnapshotId> = history.iter().map(|s| s.id).collect();
            (evicted, index)
        };

        match value {
            Ok(value) => {
                let ttl = Some(self.config.snapshot_ttl());
                self.write(&snapshot_key(id), value, ttl).await;
            }
            Err(e) => error!(snapshot_id = %id, error = %e, "Failed to serialize snapshot"),
        }
        for old in evicted {
            if let Err(e) = self.backend.delete(&snapshot_key(old)).await {
                error!(snapshot_id = %old, error = %e, "Failed to delete evicted snapshot");
            }
        }
        match serde_json::to_value(&index) {
            Ok(value) => self.write(SNAPSHOT_INDEX_KEY, value, None).await,
            Err(e) => error!(error = %e, "Failed to serialize snapshot index"),
        }

        debug!(snapshot_id = %id, reason = %reason, "Snapshot created");
        self.emit(EngineEvent::SnapshotCreated {
            snapshot_id: id,
            reason,
        });
        id
    }

    /// Replace the live state with a snapshot's copy and persist it.
    pub async fn restore_snapshot(&self, id: SnapshotId) -> ConductorResult<()> {
        let snapshot = match self.get_snapshot(id).await {
            Some(snapshot) => snapshot,
            None => {
                let value = self
                    .backend
                    .get(&snapshot_key(id))
                    .await?
                    .ok_or_else(|| ConductorError::not_found(format!("snapshot {id}")))?;
                serde_json::from_value(value)
                    .map_err(|e| ConductorError::Storage(format!("Corrupt snapshot {id}: {e}")))?
            }
        };

        {
            let mut state = self.state.write().await;
            *state = snapshot.state;
            state.ensure_roster();
            state.touch();
        }
        self.persist_state().await;
        info!(snapshot_id = %id, "Snapshot restored");
        self.emit(EngineEvent::SnapshotRestored { snapshot_id: id });
        Ok(())
    }

    pub async fn get_snapshot(&self, id: SnapshotId) -> Option<Snapshot> {
        self.history.read().await.iter().find(|s| s.id == id).cloned()
    }

    /// Most recent snapshots, newest first.
    pub async fn get_history(&self, limit: usize) -> Vec<Snapshot> {
        self.history
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_agent_memory(
        &self,
        role: AgentRole,
        tier: MemoryTier,
    ) -> HashMap<String, serde_json::Value> {
        self.state
            .read()
            .await
            .agent(role)
            .map(|a| a.memory.tier(tier).clone())
            .unwrap_or_default()
    }

    pub async fn update_agent_memory(
        &self,
        role: AgentRole,
        tier: MemoryTier,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        let key = key.into();
        self.modify_agent(role, |agent| {
            agent.memory.tier_mut(tier).insert(key, value);
        })
        .await;
    }

    pub async fn clear_short_term_memory(&self, role: AgentRole) {
        self.modify_agent(role, |agent| agent.memory.short_term.clear())
            .await;
    }

    /// Persist the live state now, returning any backend error.
    pub async fn save(&self) -> ConductorResult<()> {
        let _guard = self.save_lock.lock().await;
        let value = serde_json::to_value(&*self.state.read().await)?;
        self.backend.set(STATE_KEY, value, None).await
    }

    /// Save periodically until the store is dropped or the handle aborted.
    pub fn start_auto_save(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(e) = store.save().await {
                    error!(error = %e, "Auto-save failed");
                }
            }
        })
    }

    async fn persist_state(&self) {
        if let Err(e) = self.save().await {
            error!(error = %e, "Failed to persist system state");
        }
    }

    async fn write(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        if let Err(e) = self.backend.set(key, value, ttl).await {
            error!(key, error = %e, "State backend write failed");
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(hub) = &self.hub {
            hub.publish(event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    async fn store() -> StateStore {
        StateStore::open(Arc::new(MemoryBackend::new()), StateConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_store_has_full_roster() {
        let store = store().await;
        let state = store.get_system_state().await;
        assert_eq!(state.agents.len(), AgentRole::ALL.len());
        assert_eq!(state.phase, Phase::Planning);
    }

    #[tokio::test]
    async fn test_patch_leaves_unset_fields() {
        let store = store().await;
        let task = uuid::Uuid::new_v4();
        store
            .modify_agent(AgentRole::Architect, |a| a.assign(task))
            .await;
        store
            .update_agent_state(AgentRole::Architect, AgentStatePatch::status(AgentStatus::Working))
            .await;

        let agent = store.get_agent_state(AgentRole::Architect).await;
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.current_tasks, vec![task]);
    }

    #[tokio::test]
    async fn test_set_phase_snapshots_previous_phase() {
        let store = store().await;
        let snapshot_id = store.set_phase(Phase::Scaffold).await;

        assert_eq!(store.phase().await, Phase::Scaffold);
        let snapshot = store.get_snapshot(snapshot_id).await.unwrap();
        assert_eq!(snapshot.state.phase, Phase::Planning);
    }

    #[tokio::test]
    async fn test_history_is_capped_and_newest_first() {
        let store = StateStore::open(
            Arc::new(MemoryBackend::new()),
            StateConfig {
                max_snapshots: 2,
                ..StateConfig::default()
            },
        )
        .await
        .unwrap();
        let first = store.create_snapshot("one").await;
        store.create_snapshot("two").await;
        store.create_snapshot("three").await;

        let history = store.get_history(10).await;
        let reasons: Vec<&str> = history.iter().map(|s| s.reason.as_str()).collect();
        assert_eq!(reasons, vec!["three", "two"]);
        assert!(store.get_snapshot(first).await.is_none());
        assert!(store
            .backend()
            .get(&snapshot_key(first))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_restore_unknown_is_not_found() {
        let store = store().await;
        assert!(matches!(
            store.restore_snapshot(uuid::Uuid::new_v4()).await,
            Err(ConductorError::NotFound(_))
        ));
    }
}
