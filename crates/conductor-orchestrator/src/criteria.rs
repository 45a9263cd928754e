use async_trait::async_trait;
use conductor_core::{ConductorResult, Phase, SystemState};

/// Global context prefix of criterion flags.
pub const CRITERIA_PREFIX: &str = "criteria.";

/// Context key that records whether `criterion` holds.
pub fn criterion_key(criterion: &str) -> String {
    format!("{CRITERIA_PREFIX}{criterion}")
}

/// Decides whether a phase exit criterion holds.
#[async_trait]
pub trait CriteriaEvaluator: Send + Sync {
    async fn is_met(
        &self,
        phase: Phase,
        criterion: &str,
        state: &SystemState,
    ) -> ConductorResult<bool>;
}

/// A criterion holds when the global context flag `criteria.<name>` is `true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextCriteria;

#[async_trait]
impl CriteriaEvaluator for ContextCriteria {
    async fn is_met(
        &self,
        _phase: Phase,
        criterion: &str,
        state: &SystemState,
    ) -> ConductorResult<bool> {
        Ok(state
            .global_context
            .get(&criterion_key(criterion))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false))
    }
}
