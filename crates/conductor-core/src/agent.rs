use crate::role::AgentRole;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Blocked,
    Reviewing,
    Completed,
    Paused,
}

/// Performance counters kept per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Rolling mean over completed tasks.
    pub average_duration_ms: f64,
    /// Share of finished tasks that completed, in `[0, 1]`.
    pub quality_score: f64,
    /// Exponentially smoothed participation in team traffic, in `[0, 1]`.
    pub collaboration_score: f64,
    pub messages_sent: u64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            average_duration_ms: 0.0,
            quality_score: 1.0,
            collaboration_score: 0.5,
            messages_sent: 0,
        }
    }
}

const COLLABORATION_SMOOTHING: f64 = 0.1;

impl AgentMetrics {
    pub fn record_completion(&mut self, duration_ms: u64) {
        self.tasks_completed += 1;
        let n = self.tasks_completed as f64;
        self.average_duration_ms += (duration_ms as f64 - self.average_duration_ms) / n;
        self.refresh_quality();
    }

    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
        self.refresh_quality();
    }

    pub fn record_message_sent(&mut self) {
        self.messages_sent += 1;
        self.collaboration_score += (1.0 - self.collaboration_score) * COLLABORATION_SMOOTHING;
    }

    fn refresh_quality(&mut self) {
        let finished = self.tasks_completed + self.tasks_failed;
        if finished > 0 {
            self.quality_score = self.tasks_completed as f64 / finished as f64;
        }
    }
}

/// Which memory map to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Scratch space, cleared on demand.
    ShortTerm,
    /// Kept for the lifetime of the project.
    LongTerm,
}

/// Two-tier key/value memory of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    #[serde(default)]
    pub short_term: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub long_term: HashMap<String, serde_json::Value>,
}

impl AgentMemory {
    pub fn tier(&self, tier: MemoryTier) -> &HashMap<String, serde_json::Value> {
        match tier {
            MemoryTier::ShortTerm => &self.short_term,
            MemoryTier::LongTerm => &self.long_term,
        }
    }

    pub fn tier_mut(&mut self, tier: MemoryTier) -> &mut HashMap<String, serde_json::Value> {
        match tier {
            MemoryTier::ShortTerm => &mut self.short_term,
            MemoryTier::LongTerm => &mut self.long_term,
        }
    }
}

/// Live state of one roster agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRuntimeState {
    pub role: AgentRole,
    pub status: AgentStatus,
    /// Assigned, unfinished tasks in assignment order.
    #[serde(default)]
    pub current_tasks: Vec<TaskId>,
    #[serde(default)]
    pub metrics: AgentMetrics,
    #[serde(default)]
    pub memory: AgentMemory,
    pub last_active: DateTime<Utc>,
}

impl AgentRuntimeState {
    pub fn new(role: AgentRole) -> Self {
        Self {
            role,
            status: AgentStatus::Idle,
            current_tasks: Vec::new(),
            metrics: AgentMetrics::default(),
            memory: AgentMemory::default(),
            last_active: Utc::now(),
        }
    }

    /// Number of unfinished tasks.
    pub fn load(&self) -> usize {
        self.current_tasks.len()
    }

    pub fn assign(&mut self, task_id: TaskId) {
        if !self.current_tasks.contains(&task_id) {
            self.current_tasks.push(task_id);
        }
        self.last_active = Utc::now();
    }

    /// Drop a task from the assignment list. Returns whether it was present.
    pub fn release(&mut self, task_id: TaskId) -> bool {
        let before = self.current_tasks.len();
        self.current_tasks.retain(|id| *id != task_id);
        self.last_active = Utc::now();
        before != self.current_tasks.len()
    }
}
