//! Simulated agents for `conductor demo`.

use async_trait::async_trait;
use conductor_bus::MessageBus;
use conductor_core::{
    AgentRole, ConductorError, ConductorResult, MessagePayload, MessageType, Phase, Task,
};
use conductor_orchestrator::{
    ConductorConfig, ConflictContext, ConflictResolution, Engine, TaskRequest,
};
use conductor_queue::{JobContext, TaskExecutor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PHASE_TIMEOUT: Duration = Duration::from_secs(120);
const PROGRESS_STEPS: u8 = 4;

/// Stand-in worker: takes `delay` per task, reporting progress along the
/// way, and returns a record of the deliverable.
pub struct SimulatedExecutor {
    delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task, ctx: JobContext) -> ConductorResult<serde_json::Value> {
        let step = self.delay / u32::from(PROGRESS_STEPS);
        for i in 1..=PROGRESS_STEPS {
            tokio::select! {
                _ = tokio::time::sleep(step) => ctx.report_progress(i * (100 / PROGRESS_STEPS)),
                _ = ctx.cancelled() => {
                    return Err(ConductorError::Execution(format!("'{}' cancelled", task.title)));
                }
            }
        }
        Ok(serde_json::json!({
            "deliverable": task.title,
            "role": ctx.role,
            "attempt": ctx.attempt,
        }))
    }
}

/// Position a simulated agent takes on a question: one of the offered
/// options, picked by roster position, or a plain acknowledgement.
fn position(role: AgentRole, question: &serde_json::Value) -> serde_json::Value {
    let index = AgentRole::ALL.iter().position(|r| *r == role).unwrap_or(0);
    match question.get("options").and_then(serde_json::Value::as_array) {
        Some(options) if !options.is_empty() => options[index % options.len()].clone(),
        _ => serde_json::json!(format!("{role} acknowledges")),
    }
}

/// Make every role answer queries addressed to it.
pub fn attach_responders(bus: &MessageBus) -> ConductorResult<()> {
    for role in AgentRole::ALL {
        let responder = bus.clone();
        bus.subscribe_role(role, move |message| {
            if message.message_type() != MessageType::Query {
                return;
            }
            let MessagePayload::Query { question, .. } = &message.payload else {
                return;
            };
            if let Err(e) = responder.respond(message, role, position(role, question)) {
                warn!(role = %role, error = %e, "Simulated agent failed to answer");
            }
        })?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct PhaseRun {
    pub phase: Phase,
    pub tasks: usize,
}

#[derive(Debug, Serialize)]
pub struct DemoSummary {
    pub phases: Vec<PhaseRun>,
    pub final_phase: Phase,
    pub tasks_completed: usize,
    pub messages: usize,
    pub conflict: Option<ConflictResolution>,
}

/// Walk from the current phase to deploy: one task per deliverable, exit
/// criteria marked met, then a transition. A datastore disagreement is
/// settled during the feature phase.
pub async fn run(config: ConductorConfig, task_delay: Duration) -> anyhow::Result<DemoSummary> {
    let engine = Engine::builder(config)
        .executor(Arc::new(SimulatedExecutor::new(task_delay)))
        .start()
        .await?;
    let orch = engine.orchestrator().clone();
    attach_responders(orch.bus())?;

    let mut phases = Vec::new();
    let mut conflict = None;
    let mut phase = orch.current_phase().await;
    loop {
        let definition = phase.definition();
        for deliverable in definition.deliverables {
            let task = orch
                .submit_task(TaskRequest::new(format!("{phase}: {deliverable}")))
                .await?;
            info!(task_id = %task.id, role = %task.assigned_to, "Demo task submitted");
        }
        orch.wait_for_all(PHASE_TIMEOUT).await?;

        if phase == Phase::Feature {
            let context = ConflictContext::new("primary datastore").with_options(vec![
                serde_json::json!("postgres"),
                serde_json::json!("mongodb"),
            ]);
            let resolution = orch
                .resolve_conflict(&[AgentRole::BackendDeveloper, AgentRole::Architect], context)
                .await?;
            info!(decision = %resolution.decision, "Datastore conflict settled");
            conflict = Some(resolution);
        }

        for criterion in definition.exit_criteria {
            orch.set_criterion(criterion, true).await;
        }
        phases.push(PhaseRun {
            phase,
            tasks: definition.deliverables.len(),
        });
        if phase == Phase::Deploy {
            break;
        }
        phase = orch
            .transition_phase(phase.next())
            .await?
            .into_result()?
            .to;
    }

    let tasks_completed = orch
        .tasks()
        .iter()
        .filter(|t| t.status == conductor_core::TaskStatus::Completed)
        .count();
    let summary = DemoSummary {
        phases,
        final_phase: orch.current_phase().await,
        tasks_completed,
        messages: orch.bus().history_len(),
        conflict,
    };
    engine.shutdown().await?;
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_position_picks_offered_option() {
        let question = serde_json::json!({ "options": ["a", "b"] });
        assert_eq!(position(AgentRole::TechLead, &question), "a");
        assert_eq!(position(AgentRole::ProductManager, &question), "b");
        assert_eq!(
            position(AgentRole::Architect, &serde_json::json!("status?")),
            "architect acknowledges"
        );
    }

    #[tokio::test]
    async fn test_demo_reaches_deploy() {
        let mut config = ConductorConfig::default();
        config.state.auto_save_interval_secs = 0;
        let summary = run(config, Duration::from_millis(4)).await.unwrap();

        assert_eq!(summary.final_phase, Phase::Deploy);
        assert_eq!(summary.phases.len(), Phase::ALL.len());
        let expected: usize = Phase::ALL
            .iter()
            .map(|p| p.definition().deliverables.len())
            .sum();
        assert_eq!(summary.tasks_completed, expected);
        let conflict = summary.conflict.unwrap();
        assert_eq!(conflict.decided_by, Some(AgentRole::Architect));
        assert_eq!(conflict.decision, "postgres");
    }
}
