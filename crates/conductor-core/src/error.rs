use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the coordination engine.
///
/// Each variant corresponds to one failure class that callers are expected
/// to tell apart.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// A malformed task, message or request, rejected before it entered a queue.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Task assignment found no active, available and capable agent.
    #[error("No available agent: {0}")]
    NoAvailableAgent(String),

    /// A job failed on every allowed attempt and needs an explicit retry.
    #[error("Retry exhausted after {attempts} attempts: {reason}")]
    RetryExhausted {
        /// Number of executions performed.
        attempts: u32,
        /// Error of the last attempt.
        reason: String,
    },

    /// A bounded wait (request/response, queue drain, agent shutdown) expired.
    #[error("Timeout after {0:?}: {1}")]
    Timeout(Duration, String),

    /// Exit criteria of the current phase are not met.
    #[error("Transition rejected: {0}")]
    TransitionRejected(String),

    /// Another phase transition is being processed.
    #[error("Transition already in progress")]
    TransitionInProgress,

    /// Unknown task, job, snapshot, subscription or escalation id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Consensus resolution ran out of rounds.
    #[error("No consensus reached after {0} rounds")]
    NoConsensus(u32),

    /// A worker reported a failure while executing a task.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The durable backend failed to read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Shorthand for a [`ConductorError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Shorthand for a [`ConductorError::NotFound`].
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Shorthand for a [`ConductorError::Timeout`].
    pub fn timeout(after: Duration, what: impl Into<String>) -> Self {
        Self::Timeout(after, what.into())
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(..))
    }
}
