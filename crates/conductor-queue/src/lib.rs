//! Per-role priority work queues for the Conductor engine.
//!
//! Each agent role owns one [`WorkQueue`]. Jobs are dispatched by priority
//! (CRITICAL first) and submission order within a tier, executed by a
//! [`TaskExecutor`] under a concurrency limit, and retried with exponential
//! backoff on failure. Lifecycle changes are published as
//! [`QueueEvent`](conductor_core::QueueEvent)s on the shared event hub.
//!
//! # Main types
//!
//! - [`WorkQueue`] — The queue itself, cheap to clone.
//! - [`QueueConfig`] — Concurrency, retry, timeout and retention settings.
//! - [`TaskExecutor`] — The worker boundary implemented by callers.
//! - [`JobStatus`] / [`QueueMetrics`] — Inspection views.

/// Queue configuration.
pub mod config;
/// Worker trait and per-job context.
pub mod executor;
/// Job records and status views.
pub mod job;
/// The work queue.
pub mod queue;

pub use config::QueueConfig;
pub use executor::{JobContext, TaskExecutor};
pub use job::{JobState, JobStatus, QueueMetrics};
pub use queue::WorkQueue;
