use chrono::{DateTime, Utc};
use conductor_core::{AgentMessage, AgentRole, MessageType, Origin};
use std::collections::VecDeque;

/// Query over the message history. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub from: Option<Origin>,
    /// Messages addressed to this role (directly, by multicast or broadcast).
    pub to_role: Option<AgentRole>,
    pub message_type: Option<MessageType>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches.
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn from(mut self, origin: impl Into<Origin>) -> Self {
        self.from = Some(origin.into());
        self
    }

    pub fn to_role(mut self, role: AgentRole) -> Self {
        self.to_role = Some(role);
        self
    }

    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, message: &AgentMessage) -> bool {
        self.from.map_or(true, |f| message.from == f)
            && self.to_role.map_or(true, |r| message.is_addressed_to(r))
            && self
                .message_type
                .map_or(true, |t| message.message_type() == t)
            && self.since.map_or(true, |s| message.timestamp >= s)
    }
}

/// Bounded ring of published messages, oldest evicted first.
#[derive(Debug)]
pub(crate) struct MessageHistory {
    entries: VecDeque<AgentMessage>,
    limit: usize,
}

impl MessageHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1_024)),
            limit,
        }
    }

    pub fn record(&mut self, message: AgentMessage) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    /// Matching messages in publication order.
    pub fn query(&self, filter: &HistoryFilter) -> Vec<AgentMessage> {
        let mut matched: Vec<AgentMessage> = self
            .entries
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
