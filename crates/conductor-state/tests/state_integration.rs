#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conductor_core::*;
use conductor_state::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn memory_store() -> StateStore {
    StateStore::open(Arc::new(MemoryBackend::new()), StateConfig::default())
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// 1. Snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_is_isolated_from_later_mutations() {
    let store = memory_store().await;
    store
        .update_global_context("api_version", serde_json::json!("v1"))
        .await;
    let snapshot_id = store.create_snapshot("before refactor").await;

    store
        .update_global_context("api_version", serde_json::json!("v2"))
        .await;
    store
        .update_agent_state(
            AgentRole::BackendDeveloper,
            AgentStatePatch::status(AgentStatus::Working),
        )
        .await;

    let snapshot = store.get_snapshot(snapshot_id).await.unwrap();
    assert_eq!(
        snapshot.state.global_context.get("api_version"),
        Some(&serde_json::json!("v1"))
    );
    assert_eq!(
        snapshot.state.agent(AgentRole::BackendDeveloper).unwrap().status,
        AgentStatus::Idle
    );

    store.restore_snapshot(snapshot_id).await.unwrap();
    let state = store.get_system_state().await;
    assert_eq!(
        state.global_context.get("api_version"),
        Some(&serde_json::json!("v1"))
    );
    assert_eq!(
        state.agent(AgentRole::BackendDeveloper).unwrap().status,
        AgentStatus::Idle
    );
}

#[tokio::test]
async fn restore_is_full_replace() {
    let store = memory_store().await;
    let snapshot_id = store.create_snapshot("empty context").await;
    store
        .update_global_context("added_later", serde_json::json!(true))
        .await;
    store.set_active_agents(BTreeSet::from([AgentRole::Architect])).await;

    store.restore_snapshot(snapshot_id).await.unwrap();
    assert!(store.get_global_context("added_later").await.is_none());
    assert!(store.active_agents().await.is_empty());
}

#[tokio::test]
async fn snapshot_events_are_published() {
    let hub = EventHub::default();
    let mut events = hub.subscribe();
    let store = memory_store().await.with_event_hub(hub);

    let id = store.create_snapshot("checkpoint").await;
    store.restore_snapshot(id).await.unwrap();

    let received = events.drain();
    assert!(received.contains(&EngineEvent::SnapshotCreated {
        snapshot_id: id,
        reason: "checkpoint".into()
    }));
    assert!(received.contains(&EngineEvent::SnapshotRestored { snapshot_id: id }));
}

// ---------------------------------------------------------------------------
// 2. Durability
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_backend_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StateConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..StateConfig::default()
    };

    let snapshot_id = {
        let store = StateStore::open(backend_for(&config).await.unwrap(), config.clone())
            .await
            .unwrap();
        store.set_phase(Phase::Feature).await;
        store
            .update_agent_memory(
                AgentRole::Architect,
                MemoryTier::LongTerm,
                "decision",
                serde_json::json!("hexagonal"),
            )
            .await;
        store.create_snapshot("end of day").await
    };

    let reopened = StateStore::open(backend_for(&config).await.unwrap(), config)
        .await
        .unwrap();
    assert_eq!(reopened.phase().await, Phase::Feature);
    assert_eq!(
        reopened
            .get_agent_memory(AgentRole::Architect, MemoryTier::LongTerm)
            .await
            .get("decision"),
        Some(&serde_json::json!("hexagonal"))
    );
    let history = reopened.get_history(10).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, snapshot_id);
}

#[tokio::test]
async fn partial_roster_is_completed_on_load() {
    let backend = Arc::new(MemoryBackend::new());
    let mut state = SystemState::new();
    state.agents.retain(|role, _| *role == AgentRole::TechLead);
    backend
        .set(STATE_KEY, serde_json::to_value(&state).unwrap(), None)
        .await
        .unwrap();

    let store = StateStore::open(backend, StateConfig::default()).await.unwrap();
    let loaded = store.get_system_state().await;
    assert_eq!(loaded.agents.len(), AgentRole::ALL.len());
    assert_eq!(loaded.id, state.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mutations_persist_the_latest_state() {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(
        StateStore::open(backend.clone(), StateConfig::default())
            .await
            .unwrap(),
    );

    let writers: Vec<_> = (0..50)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update_global_context(format!("key-{i}"), serde_json::json!(i))
                    .await;
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let persisted: SystemState =
        serde_json::from_value(backend.get(STATE_KEY).await.unwrap().unwrap()).unwrap();
    assert_eq!(persisted.global_context.len(), 50);
    assert_eq!(
        persisted.global_context,
        store.get_system_state().await.global_context
    );
}

/// Backend whose writes always fail.
struct BrokenBackend {
    writes: AtomicUsize,
}

#[async_trait]
impl StateBackend for BrokenBackend {
    async fn get(&self, _key: &str) -> ConductorResult<Option<serde_json::Value>> {
        Ok(None)
    }
    async fn set(
        &self,
        _key: &str,
        _value: serde_json::Value,
        _ttl: Option<Duration>,
    ) -> ConductorResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(ConductorError::Storage("disk full".into()))
    }
    async fn delete(&self, _key: &str) -> ConductorResult<()> {
        Ok(())
    }
    async fn keys(&self, _prefix: &str) -> ConductorResult<Vec<String>> {
        Ok(vec![])
    }
    fn name(&self) -> &str {
        "broken"
    }
}

#[tokio::test]
async fn write_failures_do_not_fail_mutations() {
    let backend = Arc::new(BrokenBackend {
        writes: AtomicUsize::new(0),
    });
    let store = StateStore::open(backend.clone(), StateConfig::default())
        .await
        .unwrap();

    store
        .update_global_context("criteria.scope_frozen", serde_json::json!(true))
        .await;
    assert_eq!(
        store.get_global_context("criteria.scope_frozen").await,
        Some(serde_json::json!(true))
    );
    assert!(backend.writes.load(Ordering::SeqCst) >= 2);
    assert!(store.save().await.is_err());
}

#[tokio::test]
async fn auto_save_writes_periodically() {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(
        StateStore::open(backend.clone(), StateConfig::default())
            .await
            .unwrap(),
    );
    backend.delete(STATE_KEY).await.unwrap();

    let handle = store.start_auto_save(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(backend.get(STATE_KEY).await.unwrap().is_some());

    handle.abort();
}

// ---------------------------------------------------------------------------
// 3. Agent memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn short_term_memory_clears_independently() {
    let store = memory_store().await;
    let role = AgentRole::QaEngineer;
    store
        .update_agent_memory(role, MemoryTier::ShortTerm, "scratch", serde_json::json!(1))
        .await;
    store
        .update_agent_memory(role, MemoryTier::LongTerm, "lesson", serde_json::json!(2))
        .await;

    store.clear_short_term_memory(role).await;
    assert!(store
        .get_agent_memory(role, MemoryTier::ShortTerm)
        .await
        .is_empty());
    assert_eq!(
        store.get_agent_memory(role, MemoryTier::LongTerm).await.len(),
        1
    );
}
