use crate::config::BusConfig;
use crate::history::{HistoryFilter, MessageHistory};
use crate::pattern::ChannelPattern;
use async_trait::async_trait;
use conductor_core::{
    AgentMessage, AgentRole, ConductorError, ConductorResult, EngineEvent, EventHub,
    MessageDraft, MessagePayload, Origin, Recipient, BROADCAST_CHANNEL, MULTICAST_CHANNEL,
    REPLY_CHANNEL_PREFIX,
};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub type SubscriptionId = Uuid;
pub type HandlerId = Uuid;

/// Synchronous subscriber callback.
pub type MessageCallback = Arc<dyn Fn(&AgentMessage) + Send + Sync>;

/// Asynchronous handler registered on a channel pattern.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &AgentMessage) -> ConductorResult<()>;
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub message_id: Uuid,
    pub channel: String,
    /// Subscribers, handlers and pending requests the message was handed to.
    pub delivered_to: usize,
}

struct Subscription {
    id: SubscriptionId,
    subscriber: String,
    patterns: Vec<ChannelPattern>,
    /// Only deliver messages addressed to this role.
    addressed_to: Option<AgentRole>,
    callback: MessageCallback,
}

impl Subscription {
    fn wants(&self, channel: &str, message: &AgentMessage) -> bool {
        self.patterns.iter().any(|p| p.matches(channel))
            && self.addressed_to.map_or(true, |r| message.is_addressed_to(r))
    }
}

struct HandlerEntry {
    id: HandlerId,
    pattern: ChannelPattern,
    handler: Arc<dyn MessageHandler>,
}

/// Topic-routed publish/subscribe bus shared by all agents.
///
/// Delivery is at-most-once and best-effort: every matching subscriber and
/// handler runs on its own spawned task, and a failing or panicking one is
/// logged without affecting the publisher or its peers.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    hub: EventHub,
    subscriptions: RwLock<Vec<Subscription>>,
    handlers: RwLock<Vec<HandlerEntry>>,
    pending: Mutex<HashMap<String, oneshot::Sender<AgentMessage>>>,
    history: Mutex<MessageHistory>,
}

impl MessageBus {
    pub fn new(config: BusConfig, hub: EventHub) -> Self {
        let history = MessageHistory::new(config.history_limit);
        Self {
            inner: Arc::new(BusInner {
                config,
                hub,
                subscriptions: RwLock::new(Vec::new()),
                handlers: RwLock::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                history: Mutex::new(history),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Validate, route and record a message.
    ///
    /// Must be called from within a tokio runtime.
    pub fn publish(&self, mut message: AgentMessage) -> ConductorResult<PublishReceipt> {
        message.validate()?;
        let channel = message.channel();

        let callbacks: Vec<(String, MessageCallback)> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.wants(&channel, &message))
            .map(|s| (s.subscriber.clone(), Arc::clone(&s.callback)))
            .collect();
        let handlers: Vec<(HandlerId, Arc<dyn MessageHandler>)> = self
            .inner
            .handlers
            .read()
            .iter()
            .filter(|h| h.pattern.matches(&channel))
            .map(|h| (h.id, Arc::clone(&h.handler)))
            .collect();

        let reply_slot = channel
            .strip_prefix(REPLY_CHANNEL_PREFIX)
            .and_then(|request_id| self.inner.pending.lock().remove(request_id));

        let delivered_to = callbacks.len() + handlers.len() + usize::from(reply_slot.is_some());
        message.delivered = delivered_to > 0;
        self.inner.history.lock().record(message.clone());

        if let Some(slot) = reply_slot {
            if slot.send(message.clone()).is_err() {
                debug!(message_id = %message.id, "Requester gave up before the reply arrived");
            }
        }

        let shared = Arc::new(message);
        for (subscriber, callback) in callbacks {
            let msg = Arc::clone(&shared);
            tokio::spawn(async move {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(msg.as_ref())));
                if outcome.is_err() {
                    error!(subscriber = %subscriber, message_id = %msg.id, "Subscriber panicked");
                }
            });
        }
        for (handler_id, handler) in handlers {
            let msg = Arc::clone(&shared);
            tokio::spawn(async move {
                match AssertUnwindSafe(handler.handle(&msg)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(handler_id = %handler_id, message_id = %msg.id, error = %e, "Handler failed");
                    }
                    Err(_) => {
                        error!(handler_id = %handler_id, message_id = %msg.id, "Handler panicked");
                    }
                }
            });
        }

        debug!(
            message_id = %shared.id,
            channel = %channel,
            from = %shared.from,
            delivered_to,
            "Message published"
        );
        self.inner.hub.publish(EngineEvent::MessagePublished {
            message_id: shared.id,
            channel: channel.clone(),
            from: shared.from,
            message_type: shared.message_type(),
            delivered_to,
        });

        Ok(PublishReceipt {
            message_id: shared.id,
            channel,
            delivered_to,
        })
    }

    /// Publish a payload to a destination.
    pub fn send(
        &self,
        from: impl Into<Origin>,
        to: Recipient,
        payload: MessagePayload,
    ) -> ConductorResult<PublishReceipt> {
        self.publish(AgentMessage::new(from, to, payload))
    }

    /// Fan a message out to every role.
    pub fn broadcast(&self, draft: MessageDraft) -> ConductorResult<PublishReceipt> {
        self.publish(draft.addressed_to(Recipient::Broadcast))
    }

    /// Register a callback on one or more channel patterns. A message
    /// matching several patterns is delivered once.
    pub fn subscribe<F>(
        &self,
        subscriber: impl Into<String>,
        patterns: &[&str],
        callback: F,
    ) -> ConductorResult<SubscriptionId>
    where
        F: Fn(&AgentMessage) + Send + Sync + 'static,
    {
        self.add_subscription(subscriber.into(), patterns, None, Arc::new(callback))
    }

    /// Subscribe `role` to its own channel plus broadcast and multicast,
    /// receiving only messages addressed to it.
    pub fn subscribe_role<F>(&self, role: AgentRole, callback: F) -> ConductorResult<SubscriptionId>
    where
        F: Fn(&AgentMessage) + Send + Sync + 'static,
    {
        let own = role.channel();
        self.add_subscription(
            role.as_str().to_string(),
            &[own.as_str(), BROADCAST_CHANNEL, MULTICAST_CHANNEL],
            Some(role),
            Arc::new(callback),
        )
    }

    fn add_subscription(
        &self,
        subscriber: String,
        patterns: &[&str],
        addressed_to: Option<AgentRole>,
        callback: MessageCallback,
    ) -> ConductorResult<SubscriptionId> {
        if patterns.is_empty() {
            return Err(ConductorError::validation("subscription without patterns"));
        }
        let patterns = patterns
            .iter()
            .map(|p| ChannelPattern::new(p))
            .collect::<ConductorResult<Vec<_>>>()?;
        let id = Uuid::new_v4();
        debug!(subscriber = %subscriber, subscription_id = %id, patterns = ?patterns.iter().map(ChannelPattern::as_str).collect::<Vec<_>>(), "Subscribed");
        self.inner.subscriptions.write().push(Subscription {
            id,
            subscriber,
            patterns,
            addressed_to,
            callback,
        });
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> ConductorResult<()> {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(ConductorError::not_found(format!("subscription {id}")));
        }
        Ok(())
    }

    pub fn register_handler(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> ConductorResult<HandlerId> {
        let pattern = ChannelPattern::new(pattern)?;
        let id = Uuid::new_v4();
        debug!(handler_id = %id, pattern = %pattern, "Handler registered");
        self.inner.handlers.write().push(HandlerEntry {
            id,
            pattern,
            handler,
        });
        Ok(id)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> ConductorResult<()> {
        let mut handlers = self.inner.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        if handlers.len() == before {
            return Err(ConductorError::not_found(format!("handler {id}")));
        }
        Ok(())
    }

    /// Send a query to `to` and wait for the matching response.
    ///
    /// Falls back to `default_request_timeout_ms` when `timeout` is `None`.
    pub async fn request_response(
        &self,
        from: impl Into<Origin>,
        to: AgentRole,
        question: serde_json::Value,
        timeout: Option<Duration>,
    ) -> ConductorResult<AgentMessage> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_request_timeout());
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);

        let query = AgentMessage::new(
            from,
            Recipient::Role(to),
            MessagePayload::Query {
                request_id: request_id.clone(),
                question,
            },
        );
        if let Err(e) = self.publish(query) {
            self.inner.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.inner.pending.lock().remove(&request_id);
                Err(ConductorError::Execution(format!(
                    "reply slot for request {request_id} closed"
                )))
            }
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                warn!(to = %to, request_id = %request_id, ?timeout, "Request timed out");
                Err(ConductorError::timeout(
                    timeout,
                    format!("no response from {to} to request {request_id}"),
                ))
            }
        }
    }

    /// Answer a query on its reply channel.
    pub fn respond(
        &self,
        query: &AgentMessage,
        from: impl Into<Origin>,
        answer: serde_json::Value,
    ) -> ConductorResult<PublishReceipt> {
        let MessagePayload::Query { request_id, .. } = &query.payload else {
            return Err(ConductorError::validation(format!(
                "message {} is not a query",
                query.id
            )));
        };
        self.publish(AgentMessage::new(
            from,
            Recipient::Reply(request_id.clone()),
            MessagePayload::Response {
                request_id: request_id.clone(),
                answer,
            },
        ))
    }

    pub fn history(&self, filter: &HistoryFilter) -> Vec<AgentMessage> {
        self.inner.history.lock().query(filter)
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::Severity;

    fn bus() -> MessageBus {
        MessageBus::new(BusConfig::default(), EventHub::default())
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_recorded_undelivered() {
        let bus = bus();
        let receipt = bus
            .send(
                AgentRole::Architect,
                Recipient::Role(AgentRole::BackendDeveloper),
                MessagePayload::Task {
                    task_id: None,
                    title: "define api".into(),
                    details: serde_json::Value::Null,
                },
            )
            .unwrap();
        assert_eq!(receipt.delivered_to, 0);
        assert_eq!(receipt.channel, "role:backend_developer");

        let history = bus.history(&HistoryFilter::default());
        assert_eq!(history.len(), 1);
        assert!(!history[0].delivered);
    }

    #[tokio::test]
    async fn test_invalid_message_is_not_recorded() {
        let bus = bus();
        let err = bus
            .send(
                AgentRole::QaEngineer,
                Recipient::Roles(vec![]),
                MessagePayload::Critique {
                    subject: "tests".into(),
                    comments: vec![],
                    severity: Severity::Minor,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));
        assert_eq!(bus.history_len(), 0);
    }

    #[tokio::test]
    async fn test_respond_requires_query() {
        let bus = bus();
        let not_query = AgentMessage::new(
            AgentRole::TechLead,
            Recipient::Broadcast,
            MessagePayload::Critique {
                subject: "x".into(),
                comments: vec![],
                severity: Severity::Info,
            },
        );
        assert!(bus
            .respond(&not_query, AgentRole::Architect, serde_json::json!(1))
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let bus = bus();
        assert!(matches!(
            bus.unsubscribe(Uuid::new_v4()),
            Err(ConductorError::NotFound(_))
        ));
        assert!(matches!(
            bus.unregister_handler(Uuid::new_v4()),
            Err(ConductorError::NotFound(_))
        ));
    }
}
