//! Typed outward event stream.
//!
//! Every lifecycle change in the engine is published on an [`EventHub`]:
//! queue transitions, bus traffic, phase changes, escalations. Metrics
//! collectors, dashboards and tests subscribe to it instead of relying on
//! ambient logging.

use crate::message::{MessageType, Origin};
use crate::phase::Phase;
use crate::role::AgentRole;
use crate::state::SnapshotId;
use crate::task::{Priority, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier of one job (a task inside a work queue).
pub type JobId = Uuid;

/// Lifecycle transition of a job inside a role's work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Dispatched {
        role: AgentRole,
        job_id: JobId,
        task_id: TaskId,
        priority: Priority,
    },
    Started {
        role: AgentRole,
        job_id: JobId,
        task_id: TaskId,
        attempt: u32,
    },
    Progress {
        role: AgentRole,
        job_id: JobId,
        task_id: TaskId,
        percent: u8,
    },
    Completed {
        role: AgentRole,
        job_id: JobId,
        task_id: TaskId,
        duration_ms: u64,
        result: serde_json::Value,
    },
    Failed {
        role: AgentRole,
        job_id: JobId,
        task_id: TaskId,
        attempts: u32,
        error: String,
        /// `false` once attempts are exhausted.
        will_retry: bool,
    },
    Stalled {
        role: AgentRole,
        job_id: JobId,
        task_id: TaskId,
        attempt: u32,
    },
    Cancelled {
        role: AgentRole,
        job_id: JobId,
        task_id: TaskId,
    },
    /// Nothing waiting, delayed or running.
    Drained { role: AgentRole },
}

impl QueueEvent {
    pub fn role(&self) -> AgentRole {
        match self {
            QueueEvent::Dispatched { role, .. }
            | QueueEvent::Started { role, .. }
            | QueueEvent::Progress { role, .. }
            | QueueEvent::Completed { role, .. }
            | QueueEvent::Failed { role, .. }
            | QueueEvent::Stalled { role, .. }
            | QueueEvent::Cancelled { role, .. }
            | QueueEvent::Drained { role } => *role,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::Dispatched { job_id, .. }
            | QueueEvent::Started { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Stalled { job_id, .. }
            | QueueEvent::Cancelled { job_id, .. } => Some(*job_id),
            QueueEvent::Drained { .. } => None,
        }
    }
}

/// Engine-wide lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Queue(QueueEvent),
    MessagePublished {
        message_id: Uuid,
        channel: String,
        from: Origin,
        message_type: MessageType,
        delivered_to: usize,
    },
    TaskAssigned {
        task_id: TaskId,
        role: AgentRole,
        job_id: Option<JobId>,
    },
    TaskRedistributed {
        task_id: TaskId,
        from: AgentRole,
        to: AgentRole,
    },
    AgentOverloaded {
        role: AgentRole,
        load: usize,
    },
    AgentActivated {
        role: AgentRole,
        phase: Phase,
    },
    AgentDeactivated {
        role: AgentRole,
        phase: Phase,
        forced: bool,
    },
    PhaseTransitioned {
        from: Phase,
        to: Phase,
        at: DateTime<Utc>,
    },
    TransitionRejected {
        from: Phase,
        to: Phase,
        reason: String,
    },
    EscalationRequested {
        escalation_id: Uuid,
        roles: Vec<AgentRole>,
        topic: String,
    },
    SnapshotCreated {
        snapshot_id: SnapshotId,
        reason: String,
    },
    SnapshotRestored {
        snapshot_id: SnapshotId,
    },
}

/// Broadcast hub for [`EngineEvent`]s.
///
/// Cloning shares the underlying channel. Publishing never fails; events
/// published with no subscriber are dropped.
#[derive(Clone)]
pub struct EventHub {
    sender: Arc<broadcast::Sender<EngineEvent>>,
}

impl EventHub {
    /// Create a hub buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        debug!(?event, "engine event");
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to engine events");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receiving half of an [`EventHub`] subscription.
pub struct EventReceiver {
    receiver: broadcast::Receiver<EngineEvent>,
}

impl EventReceiver {
    /// Next event, or `None` once the hub is gone. Lagged events are skipped
    /// with a warning.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Engine event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "Engine event receiver lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Everything currently buffered.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        hub.publish(EngineEvent::Queue(QueueEvent::Drained {
            role: AgentRole::QaEngineer,
        }));
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            EngineEvent::Queue(QueueEvent::Drained {
                role: AgentRole::QaEngineer
            })
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let hub = EventHub::new(8);
        hub.publish(EngineEvent::SnapshotRestored {
            snapshot_id: Uuid::new_v4(),
        });
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        for role in [AgentRole::TechLead, AgentRole::Architect] {
            hub.publish(EngineEvent::Queue(QueueEvent::Drained { role }));
        }
        let events = rx.drain();
        let roles: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Queue(q) => Some(q.role()),
                _ => None,
            })
            .collect();
        assert_eq!(roles, vec![AgentRole::TechLead, AgentRole::Architect]);
    }
}
