use crate::role::AgentRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifier of a [`Task`].
pub type TaskId = Uuid;

/// Task and message priority. Ordered: `Critical` is highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default tier.
    #[default]
    Medium,
    /// Should run before regular work.
    High,
    /// Runs before everything else.
    Critical,
}

impl Priority {
    /// Scheduling weight, higher runs first.
    pub fn weight(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    /// High or critical.
    pub fn is_urgent(&self) -> bool {
        *self >= Priority::High
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in a queue.
    #[default]
    Pending,
    /// Being executed by its agent.
    InProgress,
    /// Held on dependencies, or failed after all retries.
    Blocked,
    /// Awaiting review.
    Review,
    /// Done.
    Completed,
    /// Removed before completion.
    Cancelled,
}

impl TaskStatus {
    /// Completed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// A unit of work owned by exactly one role queue at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub assigned_to: AgentRole,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Skills an agent needs to take this task (skill-based assignment).
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, assigned_to: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            assigned_to,
            priority: Priority::Medium,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            required_skills: Vec::new(),
            metadata: HashMap::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_skills<S: Into<String>>(mut self, skills: impl IntoIterator<Item = S>) -> Self {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    /// Pending or blocked, with every dependency in `completed`.
    pub fn is_ready(&self, completed: &[TaskId]) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Blocked)
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Set the status and bump `updated_at` plus the matching timestamp.
    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        match status {
            TaskStatus::InProgress => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Cancelled => self.completed_at = Some(now),
            _ => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Critical.weight() > Priority::Low.weight());
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_priority_serialization() {
        assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"CRITICAL\"");
        let parsed: Priority = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(parsed, Priority::Low);
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new("Implement login", AgentRole::BackendDeveloper)
            .with_priority(Priority::High)
            .with_skills(["backend"]);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.required_skills, vec!["backend".to_string()]);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_task_is_ready_with_deps() {
        let dep = Uuid::new_v4();
        let task = Task::new("Dependent", AgentRole::QaEngineer).with_dependencies(vec![dep]);
        assert!(!task.is_ready(&[]));
        assert!(task.is_ready(&[dep]));
    }

    #[test]
    fn test_set_status_timestamps() {
        let mut task = Task::new("Timestamps", AgentRole::TechLead);
        task.set_status(TaskStatus::InProgress);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());
        task.set_status(TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.status.is_terminal());
    }
}
