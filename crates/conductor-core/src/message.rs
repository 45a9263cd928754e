use crate::error::{ConductorError, ConductorResult};
use crate::role::AgentRole;
use crate::task::{Priority, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved fan-out channel.
pub const BROADCAST_CHANNEL: &str = "broadcast";
/// Reserved multi-destination channel.
pub const MULTICAST_CHANNEL: &str = "multicast";
/// Prefix of private reply channels used by request/response.
pub const REPLY_CHANNEL_PREFIX: &str = "reply:";

/// Who published a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "role")]
pub enum Origin {
    /// One of the roster agents.
    Agent(AgentRole),
    /// The orchestrator itself.
    Orchestrator,
}

impl Origin {
    /// The agent role, if the origin is an agent.
    pub fn role(&self) -> Option<AgentRole> {
        match self {
            Origin::Agent(role) => Some(*role),
            Origin::Orchestrator => None,
        }
    }
}

impl From<AgentRole> for Origin {
    fn from(role: AgentRole) -> Self {
        Origin::Agent(role)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Agent(role) => write!(f, "{role}"),
            Origin::Orchestrator => write!(f, "orchestrator"),
        }
    }
}

/// Destination of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "roles")]
pub enum Recipient {
    /// A single role.
    Role(AgentRole),
    /// Several roles.
    Roles(Vec<AgentRole>),
    /// Every role in the roster.
    Broadcast,
    /// A private reply channel (request/response).
    Reply(String),
}

impl Recipient {
    /// Bus channel this destination publishes on.
    pub fn channel(&self) -> String {
        match self {
            Recipient::Role(role) => role.channel(),
            Recipient::Roles(_) => MULTICAST_CHANNEL.to_string(),
            Recipient::Broadcast => BROADCAST_CHANNEL.to_string(),
            Recipient::Reply(request_id) => format!("{REPLY_CHANNEL_PREFIX}{request_id}"),
        }
    }

    /// Whether `role` is among the receivers.
    pub fn includes(&self, role: AgentRole) -> bool {
        match self {
            Recipient::Role(r) => *r == role,
            Recipient::Roles(roles) => roles.contains(&role),
            Recipient::Broadcast => true,
            Recipient::Reply(_) => false,
        }
    }
}

/// Message kind. Derived from the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Task,
    Query,
    Response,
    Critique,
}

/// Severity attached to a critique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Minor,
    Major,
    Blocker,
}

/// Typed message body, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum MessagePayload {
    /// Hand a piece of work to a peer.
    Task {
        task_id: Option<TaskId>,
        title: String,
        #[serde(default)]
        details: serde_json::Value,
    },
    /// Ask a peer something; the answer comes back as a `Response`.
    Query {
        request_id: String,
        question: serde_json::Value,
    },
    /// Answer to a `Query`.
    Response {
        request_id: String,
        answer: serde_json::Value,
    },
    /// Feedback on a deliverable.
    Critique {
        subject: String,
        comments: Vec<String>,
        #[serde(default)]
        severity: Severity,
    },
}

impl MessagePayload {
    /// Kind of this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Task { .. } => MessageType::Task,
            MessagePayload::Query { .. } => MessageType::Query,
            MessagePayload::Response { .. } => MessageType::Response,
            MessagePayload::Critique { .. } => MessageType::Critique,
        }
    }

    /// Request id carried by queries and responses.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            MessagePayload::Query { request_id, .. } | MessagePayload::Response { request_id, .. } => {
                Some(request_id)
            }
            _ => None,
        }
    }
}

/// A message exchanged on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    pub from: Origin,
    pub to: Recipient,
    pub payload: MessagePayload,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    /// Set once at least one subscriber received the message.
    #[serde(default)]
    pub delivered: bool,
}

impl AgentMessage {
    pub fn new(from: impl Into<Origin>, to: Recipient, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to,
            payload,
            priority: Priority::Medium,
            timestamp: Utc::now(),
            delivered: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Kind of the message.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Bus channel derived from the destination.
    pub fn channel(&self) -> String {
        self.to.channel()
    }

    /// Whether `role` is one of the receivers.
    pub fn is_addressed_to(&self, role: AgentRole) -> bool {
        self.to.includes(role)
    }

    /// Reject messages that must never enter the bus.
    pub fn validate(&self) -> ConductorResult<()> {
        if let Recipient::Roles(roles) = &self.to {
            if roles.is_empty() {
                return Err(ConductorError::validation("multicast message without recipients"));
            }
        }
        if let Recipient::Reply(id) = &self.to {
            if id.trim().is_empty() {
                return Err(ConductorError::validation("reply channel without request id"));
            }
        }
        match &self.payload {
            MessagePayload::Query { request_id, .. } | MessagePayload::Response { request_id, .. }
                if request_id.trim().is_empty() =>
            {
                Err(ConductorError::validation("query/response without request id"))
            }
            MessagePayload::Critique { subject, .. } if subject.trim().is_empty() => {
                Err(ConductorError::validation("critique without subject"))
            }
            MessagePayload::Task { title, .. } if title.trim().is_empty() => {
                Err(ConductorError::validation("task message without title"))
            }
            _ => Ok(()),
        }
    }
}

/// A message without a destination, used for broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub from: Origin,
    pub payload: MessagePayload,
    pub priority: Priority,
}

impl MessageDraft {
    pub fn new(from: impl Into<Origin>, payload: MessagePayload) -> Self {
        Self {
            from: from.into(),
            payload,
            priority: Priority::Medium,
        }
    }

    /// Complete the draft with a destination.
    pub fn addressed_to(self, to: Recipient) -> AgentMessage {
        AgentMessage::new(self.from, to, self.payload).with_priority(self.priority)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn critique() -> MessagePayload {
        MessagePayload::Critique {
            subject: "api design".into(),
            comments: vec!["naming is inconsistent".into()],
            severity: Severity::Minor,
        }
    }

    #[test]
    fn test_channels() {
        assert_eq!(Recipient::Role(AgentRole::QaEngineer).channel(), "role:qa_engineer");
        assert_eq!(Recipient::Broadcast.channel(), BROADCAST_CHANNEL);
        assert_eq!(
            Recipient::Roles(vec![AgentRole::TechLead]).channel(),
            MULTICAST_CHANNEL
        );
        assert_eq!(Recipient::Reply("abc".into()).channel(), "reply:abc");
    }

    #[test]
    fn test_addressing() {
        let msg = AgentMessage::new(
            AgentRole::TechLead,
            Recipient::Roles(vec![AgentRole::QaEngineer, AgentRole::Architect]),
            critique(),
        );
        assert!(msg.is_addressed_to(AgentRole::Architect));
        assert!(!msg.is_addressed_to(AgentRole::DevopsEngineer));
        assert_eq!(msg.message_type(), MessageType::Critique);
    }

    #[test]
    fn test_validation() {
        let empty = AgentMessage::new(AgentRole::TechLead, Recipient::Roles(vec![]), critique());
        assert!(empty.validate().is_err());

        let no_id = AgentMessage::new(
            AgentRole::TechLead,
            Recipient::Role(AgentRole::Architect),
            MessagePayload::Query {
                request_id: " ".into(),
                question: serde_json::json!("?"),
            },
        );
        assert!(no_id.validate().is_err());

        let ok = AgentMessage::new(AgentRole::TechLead, Recipient::Broadcast, critique());
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_payload_is_tagged_by_type() {
        let json = serde_json::to_value(critique()).unwrap();
        assert_eq!(json["type"], "CRITIQUE");
        let parsed: MessagePayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.message_type(), MessageType::Critique);
    }

    #[test]
    fn test_draft_addressing() {
        let msg = MessageDraft::new(Origin::Orchestrator, critique()).addressed_to(Recipient::Broadcast);
        assert_eq!(msg.from, Origin::Orchestrator);
        assert!(msg.is_addressed_to(AgentRole::TechnicalWriter));
    }
}
