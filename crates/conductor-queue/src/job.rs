use chrono::{DateTime, Utc};
use conductor_core::{JobId, Priority, Task, TaskId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Queued, waiting for a free slot.
    Waiting,
    /// Executing.
    Active,
    /// Failed an attempt, waiting out its backoff.
    Delayed,
    Completed,
    /// Failed every attempt. Only `retry_failed` brings it back.
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Public view of a job returned by [`WorkQueue::get_status`](crate::WorkQueue::get_status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub state: JobState,
    pub priority: Priority,
    pub attempts: u32,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Jobs not yet finished nor running (waiting + delayed).
    pub queue_depth: usize,
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: bool,
}

#[derive(Debug)]
pub(crate) struct JobRecord {
    pub id: JobId,
    pub task: Task,
    pub priority: Priority,
    pub seq: u64,
    pub state: JobState,
    pub attempts: u32,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
}

impl JobRecord {
    pub fn new(id: JobId, task: Task, priority: Priority, seq: u64) -> Self {
        Self {
            id,
            task,
            priority,
            seq,
            state: JobState::Waiting,
            attempts: 0,
            progress: 0,
            result: None,
            error: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            task_id: self.task.id,
            state: self.state,
            priority: self.priority,
            attempts: self.attempts,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    pub fn ticket(&self) -> Ticket {
        Ticket {
            priority: self.priority,
            seq: self.seq,
            job_id: self.id,
        }
    }
}

/// Heap entry: higher priority first, then lower sequence (FIFO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    pub priority: Priority,
    pub seq: u64,
    pub job_id: JobId,
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .weight()
            .cmp(&other.priority.weight())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
