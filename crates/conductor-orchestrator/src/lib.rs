//! Phase-driven orchestration for the Conductor engine.
//!
//! The [`Orchestrator`] ties one [`WorkQueue`](conductor_queue::WorkQueue)
//! per role, the [`MessageBus`](conductor_bus::MessageBus) and the
//! [`StateStore`](conductor_state::StateStore) together: it activates the
//! roles of the current [`Phase`](conductor_core::Phase), gates transitions
//! on exit criteria, assigns and redistributes tasks, and settles conflicts
//! between agents.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Phase lifecycle, task assignment and redistribution.
//! - [`Engine`] — Fully wired orchestrator with its background tasks.
//! - [`ConductorConfig`] — Top-level TOML configuration.
//! - [`AssignmentStrategy`] — How unassigned tasks find an agent.
//! - [`ConflictResolver`] — Voting, seniority, consensus and human override.
//! - [`CriteriaEvaluator`] — Pluggable phase exit checks.

/// Orchestrator settings.
pub mod config;
/// Conflict resolution between agents.
pub mod conflict;
/// Phase exit criteria.
pub mod criteria;
/// Engine wiring and top-level configuration.
pub mod engine;
/// The orchestrator itself.
pub mod orchestrator;
/// Agent selection strategies.
pub mod strategy;

pub use config::{OrchestratorConfig, TransitionPolicy};
pub use conflict::{
    BusDecisionProvider, ConflictContext, ConflictResolution, ConflictResolver, ConflictStrategy,
    DecisionProvider, Proposal,
};
pub use criteria::{criterion_key, ContextCriteria, CriteriaEvaluator, CRITERIA_PREFIX};
pub use engine::{ConductorConfig, Engine, EngineBuilder};
pub use orchestrator::{
    CriterionStatus, Orchestrator, OrchestratorBuilder, TaskRequest, TransitionReport,
};
pub use strategy::{AssignmentStrategy, Candidate};
