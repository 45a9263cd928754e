use async_trait::async_trait;
use conductor_bus::MessageBus;
use conductor_core::{
    AgentRole, ConductorError, ConductorResult, EngineEvent, EventHub, MessagePayload, Origin,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// How disagreements between agents are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Plurality of proposals.
    Voting,
    /// The most senior participant decides.
    #[default]
    Seniority,
    /// Repeat proposal rounds until everyone agrees.
    Consensus,
    /// Escalate to a human and wait for the decision.
    HumanOverride,
}

/// What the agents disagree about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictContext {
    pub topic: String,
    /// Suggested choices. Agents may still propose something else.
    #[serde(default)]
    pub options: Vec<serde_json::Value>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ConflictContext {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_options(mut self, options: Vec<serde_json::Value>) -> Self {
        self.options = options;
        self
    }
}

/// One agent's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub role: AgentRole,
    pub value: serde_json::Value,
}

/// Outcome of a conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    pub decision: serde_json::Value,
    /// Role whose proposal won, when a single role decided.
    pub decided_by: Option<AgentRole>,
    /// Proposals of the final round.
    pub proposals: Vec<Proposal>,
    pub rounds: u32,
    /// Set for human-override resolutions.
    pub escalation_id: Option<Uuid>,
}

/// Source of agent positions during conflict resolution.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// `previous` holds the proposals of the prior round (empty on round 1).
    async fn propose(
        &self,
        role: AgentRole,
        context: &ConflictContext,
        round: u32,
        previous: &[Proposal],
    ) -> ConductorResult<serde_json::Value>;
}

/// Asks each agent for its position over the message bus.
pub struct BusDecisionProvider {
    bus: MessageBus,
    timeout: Duration,
}

impl BusDecisionProvider {
    pub fn new(bus: MessageBus, timeout: Duration) -> Self {
        Self { bus, timeout }
    }
}

#[async_trait]
impl DecisionProvider for BusDecisionProvider {
    async fn propose(
        &self,
        role: AgentRole,
        context: &ConflictContext,
        round: u32,
        previous: &[Proposal],
    ) -> ConductorResult<serde_json::Value> {
        let question = serde_json::json!({
            "kind": "conflict",
            "topic": context.topic,
            "options": context.options,
            "details": context.details,
            "round": round,
            "previous": previous,
        });
        let reply = self
            .bus
            .request_response(Origin::Orchestrator, role, question, Some(self.timeout))
            .await?;
        match reply.payload {
            MessagePayload::Response { answer, .. } => Ok(answer),
            other => Err(ConductorError::Execution(format!(
                "{role} answered with a {:?} message",
                other.message_type()
            ))),
        }
    }
}

/// Winner of a plurality vote. Ties go to the first proposal (in order)
/// holding a tied value.
pub fn tally_votes(proposals: &[Proposal]) -> Option<&Proposal> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for p in proposals {
        *counts.entry(p.value.to_string()).or_default() += 1;
    }
    let top = counts.values().copied().max()?;
    proposals
        .iter()
        .find(|p| counts.get(&p.value.to_string()) == Some(&top))
}

/// First role of `precedence` among `participants`, else the first participant.
pub fn most_senior(precedence: &[AgentRole], participants: &[AgentRole]) -> Option<AgentRole> {
    precedence
        .iter()
        .find(|r| participants.contains(r))
        .copied()
        .or_else(|| participants.first().copied())
}

type EscalationSlots = Mutex<HashMap<Uuid, oneshot::Sender<serde_json::Value>>>;

/// Frees an escalation slot once its waiter is gone.
struct EscalationSlot<'a> {
    slots: &'a EscalationSlots,
    id: Uuid,
}

impl Drop for EscalationSlot<'_> {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.id);
    }
}

/// Runs the conflict strategies and holds open human escalations.
pub struct ConflictResolver {
    provider: Arc<dyn DecisionProvider>,
    hub: EventHub,
    seniority: Vec<AgentRole>,
    max_rounds: u32,
    escalations: EscalationSlots,
}

impl ConflictResolver {
    pub fn new(
        provider: Arc<dyn DecisionProvider>,
        hub: EventHub,
        seniority: Vec<AgentRole>,
        max_rounds: u32,
    ) -> Self {
        Self {
            provider,
            hub,
            seniority,
            max_rounds: max_rounds.max(1),
            escalations: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(
        &self,
        strategy: ConflictStrategy,
        roles: &[AgentRole],
        context: &ConflictContext,
    ) -> ConductorResult<ConflictResolution> {
        if roles.is_empty() {
            return Err(ConductorError::validation("conflict without participants"));
        }
        info!(strategy = ?strategy, topic = %context.topic, participants = roles.len(), "Resolving conflict");
        match strategy {
            ConflictStrategy::Voting => self.vote(roles, context).await,
            ConflictStrategy::Seniority => self.by_seniority(roles, context).await,
            ConflictStrategy::Consensus => self.consensus(roles, context).await,
            ConflictStrategy::HumanOverride => self.escalate(roles, context).await,
        }
    }

    async fn gather(
        &self,
        roles: &[AgentRole],
        context: &ConflictContext,
        round: u32,
        previous: &[Proposal],
    ) -> ConductorResult<Vec<Proposal>> {
        let answers = join_all(
            roles
                .iter()
                .map(|role| self.provider.propose(*role, context, round, previous)),
        )
        .await;
        roles
            .iter()
            .zip(answers)
            .map(|(role, answer)| {
                answer.map(|value| Proposal {
                    role: *role,
                    value,
                })
            })
            .collect()
    }

    async fn vote(
        &self,
        roles: &[AgentRole],
        context: &ConflictContext,
    ) -> ConductorResult<ConflictResolution> {
        let proposals = self.gather(roles, context, 1, &[]).await?;
        let winner = tally_votes(&proposals)
            .cloned()
            .ok_or_else(|| ConductorError::validation("no votes cast"))?;
        Ok(ConflictResolution {
            strategy: ConflictStrategy::Voting,
            decision: winner.value,
            decided_by: Some(winner.role),
            proposals,
            rounds: 1,
            escalation_id: None,
        })
    }

    async fn by_seniority(
        &self,
        roles: &[AgentRole],
        context: &ConflictContext,
    ) -> ConductorResult<ConflictResolution> {
        let decider = most_senior(&self.seniority, roles)
            .ok_or_else(|| ConductorError::validation("conflict without participants"))?;
        let decision = self.provider.propose(decider, context, 1, &[]).await?;
        Ok(ConflictResolution {
            strategy: ConflictStrategy::Seniority,
            decision: decision.clone(),
            decided_by: Some(decider),
            proposals: vec![Proposal {
                role: decider,
                value: decision,
            }],
            rounds: 1,
            escalation_id: None,
        })
    }

    async fn consensus(
        &self,
        roles: &[AgentRole],
        context: &ConflictContext,
    ) -> ConductorResult<ConflictResolution> {
        let mut previous = Vec::new();
        for round in 1..=self.max_rounds {
            let proposals = self.gather(roles, context, round, &previous).await?;
            let agreed = proposals
                .first()
                .filter(|first| proposals.iter().all(|p| p.value == first.value))
                .map(|first| first.value.clone());
            if let Some(decision) = agreed {
                return Ok(ConflictResolution {
                    strategy: ConflictStrategy::Consensus,
                    decision,
                    decided_by: None,
                    proposals,
                    rounds: round,
                    escalation_id: None,
                });
            }
            previous = proposals;
        }
        warn!(topic = %context.topic, rounds = self.max_rounds, "Consensus not reached");
        Err(ConductorError::NoConsensus(self.max_rounds))
    }

    async fn escalate(
        &self,
        roles: &[AgentRole],
        context: &ConflictContext,
    ) -> ConductorResult<ConflictResolution> {
        let escalation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.escalations.lock().insert(escalation_id, tx);
        let _slot = EscalationSlot {
            slots: &self.escalations,
            id: escalation_id,
        };
        info!(escalation_id = %escalation_id, topic = %context.topic, "Conflict escalated to a human");
        self.hub.publish(EngineEvent::EscalationRequested {
            escalation_id,
            roles: roles.to_vec(),
            topic: context.topic.clone(),
        });

        let decision = rx.await.map_err(|_| {
            ConductorError::Execution(format!("escalation {escalation_id} was abandoned"))
        })?;
        Ok(ConflictResolution {
            strategy: ConflictStrategy::HumanOverride,
            decision,
            decided_by: None,
            proposals: Vec::new(),
            rounds: 1,
            escalation_id: Some(escalation_id),
        })
    }

    /// Deliver a human decision to a waiting escalation.
    pub fn resolve_escalation(
        &self,
        escalation_id: Uuid,
        decision: serde_json::Value,
    ) -> ConductorResult<()> {
        let slot = self
            .escalations
            .lock()
            .remove(&escalation_id)
            .ok_or_else(|| ConductorError::not_found(format!("escalation {escalation_id}")))?;
        slot.send(decision).map_err(|_| {
            ConductorError::Execution(format!("escalation {escalation_id} is no longer awaited"))
        })
    }

    pub fn pending_escalations(&self) -> Vec<Uuid> {
        self.escalations.lock().keys().copied().collect()
    }
}
