use crate::conflict::ConflictStrategy;
use crate::strategy::AssignmentStrategy;
use conductor_core::AgentRole;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether a transition may target any phase or only the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    #[default]
    Free,
    Sequential,
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub strategy: AssignmentStrategy,
    /// Agents at this many unfinished tasks receive no new automatic assignments.
    #[serde(default = "default_max_load_per_agent")]
    pub max_load_per_agent: usize,
    /// Move waiting work off an agent whose load exceeds `max_load_per_agent`.
    #[serde(default = "default_auto_redistribute")]
    pub auto_redistribute: bool,
    /// How long a leaving agent may finish running work before it is force-stopped.
    #[serde(default = "default_deactivation_timeout_ms")]
    pub deactivation_timeout_ms: u64,
    /// How long a transition waits for active queues to drain.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub transition_policy: TransitionPolicy,
    /// Precedence used by seniority conflict resolution, most senior first.
    #[serde(default = "default_seniority")]
    pub seniority: Vec<AgentRole>,
    #[serde(default = "default_max_consensus_rounds")]
    pub max_consensus_rounds: u32,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
}

fn default_max_load_per_agent() -> usize {
    5
}
fn default_auto_redistribute() -> bool {
    true
}
fn default_deactivation_timeout_ms() -> u64 {
    30_000
}
fn default_drain_timeout_ms() -> u64 {
    300_000
}
fn default_max_consensus_rounds() -> u32 {
    3
}

/// tech_lead, architect, product_manager, security_engineer, then the rest
/// of the roster.
pub fn default_seniority() -> Vec<AgentRole> {
    vec![
        AgentRole::TechLead,
        AgentRole::Architect,
        AgentRole::ProductManager,
        AgentRole::SecurityEngineer,
        AgentRole::DevopsEngineer,
        AgentRole::BackendDeveloper,
        AgentRole::FrontendDeveloper,
        AgentRole::QaEngineer,
        AgentRole::UxDesigner,
        AgentRole::TechnicalWriter,
    ]
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: AssignmentStrategy::default(),
            max_load_per_agent: default_max_load_per_agent(),
            auto_redistribute: default_auto_redistribute(),
            deactivation_timeout_ms: default_deactivation_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            transition_policy: TransitionPolicy::default(),
            seniority: default_seniority(),
            max_consensus_rounds: default_max_consensus_rounds(),
            conflict_strategy: ConflictStrategy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn deactivation_timeout(&self) -> Duration {
        Duration::from_millis(self.deactivation_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_seniority_covers_roster() {
        let seniority = default_seniority();
        assert_eq!(seniority.len(), AgentRole::ALL.len());
        for role in AgentRole::ALL {
            assert!(seniority.contains(&role));
        }
    }

    #[test]
    fn test_toml_section() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            strategy = "skill_based"
            transition_policy = "sequential"
            conflict_strategy = "voting"
            seniority = ["architect", "tech_lead"]
            "#,
        )
        .unwrap();
        assert_eq!(config.strategy, AssignmentStrategy::SkillBased);
        assert_eq!(config.transition_policy, TransitionPolicy::Sequential);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Voting);
        assert_eq!(config.seniority[0], AgentRole::Architect);
        assert_eq!(config.max_load_per_agent, 5);
    }
}
