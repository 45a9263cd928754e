#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conductor_bus::*;
use conductor_core::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn bus() -> MessageBus {
    MessageBus::new(BusConfig::default(), EventHub::default())
}

fn task_payload(title: &str) -> MessagePayload {
    MessagePayload::Task {
        task_id: None,
        title: title.to_string(),
        details: serde_json::Value::Null,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ---------------------------------------------------------------------------
// 1. Routing and pattern subscriptions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn role_wildcard_fires_once_per_message() {
    let bus = bus();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    bus.subscribe("observer", &["role:*", "role:backend_developer"], move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let receipt = bus
        .send(
            AgentRole::Architect,
            Recipient::Role(AgentRole::BackendDeveloper),
            task_payload("build endpoints"),
        )
        .unwrap();
    assert_eq!(receipt.delivered_to, 1);
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Not a role channel.
    bus.broadcast(MessageDraft::new(AgentRole::TechLead, task_payload("kickoff")))
        .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn role_subscription_filters_multicast_by_addressing() {
    let bus = bus();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backend_tx = tx.clone();
    bus.subscribe_role(AgentRole::BackendDeveloper, move |m| {
        let _ = backend_tx.send((AgentRole::BackendDeveloper, m.id));
    })
    .unwrap();
    bus.subscribe_role(AgentRole::UxDesigner, move |m| {
        let _ = tx.send((AgentRole::UxDesigner, m.id));
    })
    .unwrap();

    let multicast = bus
        .send(
            AgentRole::Architect,
            Recipient::Roles(vec![AgentRole::BackendDeveloper, AgentRole::DevopsEngineer]),
            task_payload("wire up ci"),
        )
        .unwrap();
    assert_eq!(multicast.delivered_to, 1);

    let broadcast = bus
        .broadcast(MessageDraft::new(AgentRole::TechLead, task_payload("standup")))
        .unwrap();
    assert_eq!(broadcast.delivered_to, 2);

    settle().await;
    let mut received = Vec::new();
    while let Ok(entry) = rx.try_recv() {
        received.push(entry);
    }
    assert_eq!(received.len(), 3);
    assert!(received.contains(&(AgentRole::BackendDeveloper, multicast.message_id)));
    assert!(!received.contains(&(AgentRole::UxDesigner, multicast.message_id)));
}

#[tokio::test]
async fn unsubscribed_callback_stops_receiving() {
    let bus = bus();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let id = bus
        .subscribe("temp", &["broadcast"], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    bus.unsubscribe(id).unwrap();
    assert_eq!(bus.subscription_count(), 0);

    let receipt = bus
        .broadcast(MessageDraft::new(AgentRole::TechLead, task_payload("ping")))
        .unwrap();
    assert_eq!(receipt.delivered_to, 0);
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// 2. Handler isolation
// ---------------------------------------------------------------------------

struct Failing;

#[async_trait]
impl MessageHandler for Failing {
    async fn handle(&self, _message: &AgentMessage) -> ConductorResult<()> {
        Err(ConductorError::Execution("handler broke".into()))
    }
}

struct Panicking;

#[async_trait]
impl MessageHandler for Panicking {
    async fn handle(&self, _message: &AgentMessage) -> ConductorResult<()> {
        panic!("handler exploded");
    }
}

struct Counting(Arc<AtomicUsize>);

#[async_trait]
impl MessageHandler for Counting {
    async fn handle(&self, _message: &AgentMessage) -> ConductorResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn failing_handlers_do_not_affect_peers() {
    let bus = bus();
    let hits = Arc::new(AtomicUsize::new(0));
    bus.register_handler("role:*", Arc::new(Failing)).unwrap();
    bus.register_handler("role:*", Arc::new(Panicking)).unwrap();
    bus.register_handler("role:qa_engineer", Arc::new(Counting(hits.clone())))
        .unwrap();
    bus.subscribe("panicky", &["role:qa_engineer"], |_| panic!("callback exploded"))
        .unwrap();

    let receipt = bus
        .send(
            AgentRole::BackendDeveloper,
            Recipient::Role(AgentRole::QaEngineer),
            task_payload("test the api"),
        )
        .unwrap();
    assert_eq!(receipt.delivered_to, 4);
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The bus keeps working after the failures.
    bus.send(
        AgentRole::BackendDeveloper,
        Recipient::Role(AgentRole::QaEngineer),
        task_payload("test again"),
    )
    .unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// 3. Request / response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_response_round_trip() {
    let bus = bus();
    let responder = bus.clone();
    bus.subscribe_role(AgentRole::Architect, move |m| {
        if m.message_type() == MessageType::Query {
            responder
                .respond(m, AgentRole::Architect, serde_json::json!("use postgres"))
                .unwrap();
        }
    })
    .unwrap();

    let reply = bus
        .request_response(
            Origin::Orchestrator,
            AgentRole::Architect,
            serde_json::json!("which database?"),
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert_eq!(reply.from, Origin::Agent(AgentRole::Architect));
    match reply.payload {
        MessagePayload::Response { answer, .. } => assert_eq!(answer, "use postgres"),
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(bus.pending_requests(), 0);
}

#[tokio::test]
async fn request_without_responder_times_out() {
    let bus = bus();
    let started = Instant::now();
    let err = bus
        .request_response(
            AgentRole::TechLead,
            AgentRole::SecurityEngineer,
            serde_json::json!("is this safe?"),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    let elapsed = started.elapsed();
    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(bus.pending_requests(), 0);
}

// ---------------------------------------------------------------------------
// 4. History and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_filters_and_caps() {
    let bus = MessageBus::new(
        BusConfig {
            history_limit: 3,
            ..BusConfig::default()
        },
        EventHub::default(),
    );
    for title in ["a", "b", "c", "d"] {
        bus.send(
            AgentRole::ProductManager,
            Recipient::Role(AgentRole::UxDesigner),
            task_payload(title),
        )
        .unwrap();
    }
    bus.send(
        AgentRole::QaEngineer,
        Recipient::Role(AgentRole::BackendDeveloper),
        MessagePayload::Critique {
            subject: "flaky test".into(),
            comments: vec!["retry logic".into()],
            severity: Severity::Major,
        },
    )
    .unwrap();

    assert_eq!(bus.history_len(), 3);
    let critiques = bus.history(&HistoryFilter::default().of_type(MessageType::Critique));
    assert_eq!(critiques.len(), 1);
    let to_ux = bus.history(&HistoryFilter::default().to_role(AgentRole::UxDesigner));
    assert_eq!(to_ux.len(), 2);
}

#[tokio::test]
async fn published_messages_reach_event_hub() {
    let hub = EventHub::default();
    let mut events = hub.subscribe();
    let bus = MessageBus::new(BusConfig::default(), hub);

    bus.send(
        AgentRole::DevopsEngineer,
        Recipient::Role(AgentRole::TechLead),
        task_payload("approve release"),
    )
    .unwrap();

    match events.try_recv() {
        Some(EngineEvent::MessagePublished {
            channel,
            from,
            message_type,
            ..
        }) => {
            assert_eq!(channel, "role:tech_lead");
            assert_eq!(from, Origin::Agent(AgentRole::DevopsEngineer));
            assert_eq!(message_type, MessageType::Task);
        }
        other => panic!("unexpected event {other:?}"),
    }
}
