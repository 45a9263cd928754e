use crate::agent::AgentRuntimeState;
use crate::phase::Phase;
use crate::role::AgentRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Identifier of a [`Snapshot`].
pub type SnapshotId = Uuid;

/// Aggregate root of the engine: the unit of persistence and snapshotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub id: Uuid,
    pub phase: Phase,
    /// Roles currently activated by the orchestrator.
    #[serde(default)]
    pub active_agents: BTreeSet<AgentRole>,
    pub agents: BTreeMap<AgentRole, AgentRuntimeState>,
    #[serde(default)]
    pub global_context: HashMap<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl SystemState {
    /// Fresh state in the initial phase with one runtime state per roster role.
    pub fn new() -> Self {
        let agents = AgentRole::ALL
            .iter()
            .map(|role| (*role, AgentRuntimeState::new(*role)))
            .collect();
        Self {
            id: Uuid::new_v4(),
            phase: Phase::Planning,
            active_agents: BTreeSet::new(),
            agents,
            global_context: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Add a runtime state for every roster role that lacks one.
    /// Returns how many were added.
    pub fn ensure_roster(&mut self) -> usize {
        let mut added = 0;
        for role in AgentRole::ALL {
            self.agents.entry(role).or_insert_with(|| {
                added += 1;
                AgentRuntimeState::new(role)
            });
        }
        added
    }

    pub fn agent(&self, role: AgentRole) -> Option<&AgentRuntimeState> {
        self.agents.get(&role)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable point-in-time copy of the system state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub state: SystemState,
}

impl Snapshot {
    pub fn capture(state: &SystemState, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason: reason.into(),
            created_at: Utc::now(),
            state: state.clone(),
        }
    }
}
