use crate::error::ConductorError;
use crate::role::AgentRole;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Ordered lifecycle stage of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Planning,
    Scaffold,
    Feature,
    Test,
    Review,
    Deploy,
}

/// Static configuration of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDefinition {
    pub phase: Phase,
    /// Roles working during this phase.
    pub active_roles: &'static [AgentRole],
    /// Named conditions that must all hold before leaving the phase.
    pub exit_criteria: &'static [&'static str],
    /// Artifacts the phase is expected to produce.
    pub deliverables: &'static [&'static str],
}

const PLANNING: PhaseDefinition = PhaseDefinition {
    phase: Phase::Planning,
    active_roles: &[
        AgentRole::TechLead,
        AgentRole::ProductManager,
        AgentRole::Architect,
        AgentRole::UxDesigner,
    ],
    exit_criteria: &["requirements_defined", "architecture_approved"],
    deliverables: &["requirements_doc", "architecture_doc", "task_breakdown"],
};

const SCAFFOLD: PhaseDefinition = PhaseDefinition {
    phase: Phase::Scaffold,
    active_roles: &[
        AgentRole::TechLead,
        AgentRole::Architect,
        AgentRole::BackendDeveloper,
        AgentRole::FrontendDeveloper,
        AgentRole::DevopsEngineer,
    ],
    exit_criteria: &["project_structure_created", "ci_pipeline_configured"],
    deliverables: &["repository_skeleton", "ci_pipeline"],
};

const FEATURE: PhaseDefinition = PhaseDefinition {
    phase: Phase::Feature,
    active_roles: &[
        AgentRole::TechLead,
        AgentRole::BackendDeveloper,
        AgentRole::FrontendDeveloper,
        AgentRole::UxDesigner,
        AgentRole::QaEngineer,
    ],
    exit_criteria: &["features_implemented", "code_reviewed"],
    deliverables: &["feature_code", "api_docs"],
};

const TEST: PhaseDefinition = PhaseDefinition {
    phase: Phase::Test,
    active_roles: &[
        AgentRole::QaEngineer,
        AgentRole::SecurityEngineer,
        AgentRole::BackendDeveloper,
        AgentRole::FrontendDeveloper,
    ],
    exit_criteria: &["tests_passing", "coverage_met", "security_scan_passed"],
    deliverables: &["test_report", "coverage_report", "security_report"],
};

const REVIEW: PhaseDefinition = PhaseDefinition {
    phase: Phase::Review,
    active_roles: &[
        AgentRole::TechLead,
        AgentRole::SecurityEngineer,
        AgentRole::TechnicalWriter,
        AgentRole::QaEngineer,
    ],
    exit_criteria: &["review_approved", "documentation_complete"],
    deliverables: &["review_notes", "user_docs"],
};

const DEPLOY: PhaseDefinition = PhaseDefinition {
    phase: Phase::Deploy,
    active_roles: &[
        AgentRole::DevopsEngineer,
        AgentRole::TechLead,
        AgentRole::SecurityEngineer,
    ],
    exit_criteria: &["deployed", "smoke_tests_passed"],
    deliverables: &["release_notes", "deployment_log"],
};

impl Phase {
    /// All phases in workflow order.
    pub const ALL: [Phase; 6] = [
        Phase::Planning,
        Phase::Scaffold,
        Phase::Feature,
        Phase::Test,
        Phase::Review,
        Phase::Deploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Scaffold => "scaffold",
            Phase::Feature => "feature",
            Phase::Test => "test",
            Phase::Review => "review",
            Phase::Deploy => "deploy",
        }
    }

    /// Static configuration of this phase.
    pub fn definition(&self) -> &'static PhaseDefinition {
        match self {
            Phase::Planning => &PLANNING,
            Phase::Scaffold => &SCAFFOLD,
            Phase::Feature => &FEATURE,
            Phase::Test => &TEST,
            Phase::Review => &REVIEW,
            Phase::Deploy => &DEPLOY,
        }
    }

    /// Following phase; `Deploy` wraps back to `Planning` for the next iteration.
    pub fn next(&self) -> Phase {
        match self {
            Phase::Planning => Phase::Scaffold,
            Phase::Scaffold => Phase::Feature,
            Phase::Feature => Phase::Test,
            Phase::Test => Phase::Review,
            Phase::Review => Phase::Deploy,
            Phase::Deploy => Phase::Planning,
        }
    }

    pub fn is_active(&self, role: AgentRole) -> bool {
        self.definition().active_roles.contains(&role)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| ConductorError::validation(format!("unknown phase '{s}'")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_wrap() {
        assert_eq!(Phase::default(), Phase::Planning);
        let mut phase = Phase::Planning;
        for expected in &Phase::ALL[1..] {
            phase = phase.next();
            assert_eq!(phase, *expected);
        }
        assert_eq!(Phase::Deploy.next(), Phase::Planning);
    }

    #[test]
    fn test_definitions_are_consistent() {
        for phase in Phase::ALL {
            let def = phase.definition();
            assert_eq!(def.phase, phase);
            assert!(!def.active_roles.is_empty());
            assert!(!def.exit_criteria.is_empty());
            assert!(!def.deliverables.is_empty());
        }
    }

    #[test]
    fn test_qa_not_active_in_deploy() {
        assert!(!Phase::Deploy.is_active(AgentRole::QaEngineer));
        assert!(Phase::Test.is_active(AgentRole::QaEngineer));
    }

    #[test]
    fn test_parse() {
        assert_eq!("review".parse::<Phase>().unwrap(), Phase::Review);
        assert!("shipping".parse::<Phase>().is_err());
    }
}
