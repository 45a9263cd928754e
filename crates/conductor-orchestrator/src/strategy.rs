use conductor_core::{AgentRole, Task};
use serde::{Deserialize, Serialize};

/// How the orchestrator picks an agent for an unassigned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Rotate through the eligible agents.
    RoundRobin,
    /// Lowest current load.
    #[default]
    LoadBalanced,
    /// Agents whose capabilities cover the task's skills, then lowest load.
    SkillBased,
    /// Urgent tasks to the highest quality score, the rest by load.
    PriorityBased,
}

/// An eligible agent as seen by a strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub role: AgentRole,
    pub load: usize,
    pub quality: f64,
}

impl AssignmentStrategy {
    /// Pick a role among `candidates` (in roster order). `cursor` is the
    /// round-robin position and only moves for that strategy.
    pub fn select(&self, task: &Task, candidates: &[Candidate], cursor: &mut usize) -> Option<AgentRole> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            AssignmentStrategy::RoundRobin => {
                let pick = candidates[*cursor % candidates.len()].role;
                *cursor = cursor.wrapping_add(1);
                Some(pick)
            }
            AssignmentStrategy::LoadBalanced => least_loaded(candidates.iter()),
            AssignmentStrategy::SkillBased => least_loaded(
                candidates
                    .iter()
                    .filter(|c| c.role.has_skills(&task.required_skills)),
            ),
            AssignmentStrategy::PriorityBased if task.priority.is_urgent() => {
                let mut best: Option<&Candidate> = None;
                for c in candidates {
                    if best.map_or(true, |b| c.quality > b.quality) {
                        best = Some(c);
                    }
                }
                best.map(|c| c.role)
            }
            AssignmentStrategy::PriorityBased => least_loaded(candidates.iter()),
        }
    }
}

/// First candidate with the minimum load.
pub(crate) fn least_loaded<'a>(candidates: impl Iterator<Item = &'a Candidate>) -> Option<AgentRole> {
    candidates.min_by_key(|c| c.load).map(|c| c.role)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::Priority;

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate {
                role: AgentRole::TechLead,
                load: 2,
                quality: 0.9,
            },
            Candidate {
                role: AgentRole::Architect,
                load: 1,
                quality: 0.7,
            },
            Candidate {
                role: AgentRole::BackendDeveloper,
                load: 1,
                quality: 1.0,
            },
        ]
    }

    fn task() -> Task {
        Task::new("t", AgentRole::TechLead)
    }

    #[test]
    fn test_round_robin_rotates() {
        let mut cursor = 0;
        let picks: Vec<AgentRole> = (0..4)
            .filter_map(|_| AssignmentStrategy::RoundRobin.select(&task(), &candidates(), &mut cursor))
            .collect();
        assert_eq!(
            picks,
            vec![
                AgentRole::TechLead,
                AgentRole::Architect,
                AgentRole::BackendDeveloper,
                AgentRole::TechLead
            ]
        );
    }

    #[test]
    fn test_load_balanced_breaks_ties_by_roster_order() {
        let mut cursor = 0;
        assert_eq!(
            AssignmentStrategy::LoadBalanced.select(&task(), &candidates(), &mut cursor),
            Some(AgentRole::Architect)
        );
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_skill_based_requires_capabilities() {
        let mut cursor = 0;
        let db = task().with_skills(["database", "testing"]);
        assert_eq!(
            AssignmentStrategy::SkillBased.select(&db, &candidates(), &mut cursor),
            Some(AgentRole::BackendDeveloper)
        );

        let ops = task().with_skills(["deployment"]);
        assert_eq!(
            AssignmentStrategy::SkillBased.select(&ops, &candidates(), &mut cursor),
            None
        );
    }

    #[test]
    fn test_priority_based_routes_urgent_to_quality() {
        let mut cursor = 0;
        let urgent = task().with_priority(Priority::Critical);
        assert_eq!(
            AssignmentStrategy::PriorityBased.select(&urgent, &candidates(), &mut cursor),
            Some(AgentRole::BackendDeveloper)
        );
        let routine = task().with_priority(Priority::Low);
        assert_eq!(
            AssignmentStrategy::PriorityBased.select(&routine, &candidates(), &mut cursor),
            Some(AgentRole::Architect)
        );
    }
}
