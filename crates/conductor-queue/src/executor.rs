use async_trait::async_trait;
use conductor_core::{AgentRole, ConductorResult, JobId, Task};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The worker boundary: executes one task on behalf of an agent.
///
/// Implementations produce whatever output their role calls for. The queue
/// only cares about success (a JSON result) or failure (an error, retried
/// per the queue's policy).
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: JobContext) -> ConductorResult<serde_json::Value>;
}

type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Per-execution handle given to a [`TaskExecutor`].
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub role: AgentRole,
    /// 1-based attempt number.
    pub attempt: u32,
    cancel: CancellationToken,
    progress: ProgressFn,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        role: AgentRole,
        attempt: u32,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Self {
        Self {
            job_id,
            role,
            attempt,
            cancel,
            progress,
        }
    }

    /// Report completion percentage (clamped to 100).
    pub fn report_progress(&self, percent: u8) {
        (self.progress)(percent.min(100));
    }

    /// Whether the job was cancelled while running.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The underlying token, for `tokio::select!`.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("role", &self.role)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
