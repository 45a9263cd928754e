use crate::error::ConductorError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Role of each agent in the team. The roster is closed: every variant
/// always has exactly one runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Owns technical direction and has the final word on disputes.
    TechLead,
    /// Owns requirements and scope.
    ProductManager,
    /// Designs system structure and interfaces.
    Architect,
    /// Designs user flows and interfaces.
    UxDesigner,
    /// Builds client-side code.
    FrontendDeveloper,
    /// Builds server-side code.
    BackendDeveloper,
    /// Owns build, CI and deployment.
    DevopsEngineer,
    /// Writes and runs tests.
    QaEngineer,
    /// Reviews for vulnerabilities and compliance.
    SecurityEngineer,
    /// Writes user and API documentation.
    TechnicalWriter,
}

impl AgentRole {
    /// The full roster in canonical order.
    pub const ALL: [AgentRole; 10] = [
        AgentRole::TechLead,
        AgentRole::ProductManager,
        AgentRole::Architect,
        AgentRole::UxDesigner,
        AgentRole::FrontendDeveloper,
        AgentRole::BackendDeveloper,
        AgentRole::DevopsEngineer,
        AgentRole::QaEngineer,
        AgentRole::SecurityEngineer,
        AgentRole::TechnicalWriter,
    ];

    /// Stable snake_case identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::TechLead => "tech_lead",
            AgentRole::ProductManager => "product_manager",
            AgentRole::Architect => "architect",
            AgentRole::UxDesigner => "ux_designer",
            AgentRole::FrontendDeveloper => "frontend_developer",
            AgentRole::BackendDeveloper => "backend_developer",
            AgentRole::DevopsEngineer => "devops_engineer",
            AgentRole::QaEngineer => "qa_engineer",
            AgentRole::SecurityEngineer => "security_engineer",
            AgentRole::TechnicalWriter => "technical_writer",
        }
    }

    /// Skills this role can take on. Used by skill-based assignment.
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            AgentRole::TechLead => &[
                "architecture",
                "code_review",
                "planning",
                "mentoring",
                "backend",
                "frontend",
            ],
            AgentRole::ProductManager => &["requirements", "planning", "prioritization", "documentation"],
            AgentRole::Architect => &["architecture", "api_design", "database", "performance"],
            AgentRole::UxDesigner => &["ui_design", "user_research", "prototyping", "accessibility"],
            AgentRole::FrontendDeveloper => &["frontend", "ui_design", "testing", "accessibility"],
            AgentRole::BackendDeveloper => &["backend", "api_design", "database", "testing"],
            AgentRole::DevopsEngineer => &["deployment", "ci_cd", "infrastructure", "monitoring"],
            AgentRole::QaEngineer => &["testing", "automation", "code_review", "performance"],
            AgentRole::SecurityEngineer => &["security", "code_review", "compliance", "infrastructure"],
            AgentRole::TechnicalWriter => &["documentation", "api_docs", "requirements"],
        }
    }

    /// Whether the role covers every skill in `required`.
    pub fn has_skills<S: AsRef<str>>(&self, required: &[S]) -> bool {
        let caps = self.capabilities();
        required.iter().all(|skill| caps.contains(&skill.as_ref()))
    }

    /// Unicast channel name on the message bus.
    pub fn channel(&self) -> String {
        format!("role:{}", self.as_str())
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| ConductorError::validation(format!("unknown agent role '{s}'")))
    }
}
