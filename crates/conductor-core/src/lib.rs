//! Core types and error definitions for the Conductor coordination engine.
//!
//! This crate provides the foundational types shared by the queue, bus,
//! state and orchestrator crates.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all engine subsystems.
//! - [`AgentRole`] — The closed roster of specialized agents.
//! - [`Task`] — A unit of work with priority, status and dependencies.
//! - [`AgentMessage`] — A typed message exchanged on the bus.
//! - [`Phase`] — Ordered workflow stage with its static definition.
//! - [`SystemState`] / [`Snapshot`] — Aggregate root and its point-in-time copy.
//! - [`EventHub`] — Broadcast stream of [`EngineEvent`]s.

/// Per-agent runtime state, metrics and memory.
pub mod agent;
/// Error type and result alias.
pub mod error;
/// Engine event stream.
pub mod events;
/// Bus messages and destinations.
pub mod message;
/// Workflow phases and their static definitions.
pub mod phase;
/// The agent roster.
pub mod role;
/// System state and snapshots.
pub mod state;
/// Tasks and priorities.
pub mod task;

pub use agent::{AgentMemory, AgentMetrics, AgentRuntimeState, AgentStatus, MemoryTier};
pub use error::{ConductorError, ConductorResult};
pub use events::{EngineEvent, EventHub, EventReceiver, JobId, QueueEvent};
pub use message::{
    AgentMessage, MessageDraft, MessagePayload, MessageType, Origin, Recipient, Severity,
    BROADCAST_CHANNEL, MULTICAST_CHANNEL, REPLY_CHANNEL_PREFIX,
};
pub use phase::{Phase, PhaseDefinition};
pub use role::AgentRole;
pub use state::{Snapshot, SnapshotId, SystemState};
pub use task::{Priority, Task, TaskId, TaskStatus};
