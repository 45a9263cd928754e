use crate::config::OrchestratorConfig;
use crate::conflict::DecisionProvider;
use crate::criteria::CriteriaEvaluator;
use crate::orchestrator::Orchestrator;
use conductor_bus::{BusConfig, MessageBus};
use conductor_core::{AgentRole, ConductorError, ConductorResult, EventHub};
use conductor_queue::{QueueConfig, TaskExecutor, WorkQueue};
use conductor_state::{backend_for, StateBackend, StateConfig, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Top-level configuration, usually read from `conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Settings shared by every role queue.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Per-role queue settings keyed by role name, e.g. `backend_developer`.
    #[serde(default)]
    pub queue_overrides: HashMap<String, QueueConfig>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl ConductorConfig {
    /// Read a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> ConductorResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content).map_err(|e| {
            ConductorError::Config(format!("Failed to parse config '{}': {}", path.display(), e))
        })
    }

    pub fn from_toml_str(content: &str) -> ConductorResult<Self> {
        toml::from_str(content).map_err(|e| ConductorError::Config(e.to_string()))
    }

    /// Queue settings for `role`, override first.
    pub fn queue_config(&self, role: AgentRole) -> ConductorResult<QueueConfig> {
        for name in self.queue_overrides.keys() {
            name.parse::<AgentRole>().map_err(|_| {
                ConductorError::Config(format!("queue override for unknown role '{name}'"))
            })?;
        }
        Ok(self
            .queue_overrides
            .get(role.as_str())
            .cloned()
            .unwrap_or_else(|| self.queue.clone()))
    }
}

/// Builds and starts a fully wired [`Engine`].
pub struct EngineBuilder {
    config: ConductorConfig,
    executor: Option<Arc<dyn TaskExecutor>>,
    role_executors: HashMap<AgentRole, Arc<dyn TaskExecutor>>,
    criteria: Option<Arc<dyn CriteriaEvaluator>>,
    decisions: Option<Arc<dyn DecisionProvider>>,
    backend: Option<Arc<dyn StateBackend>>,
}

impl EngineBuilder {
    /// Executor used by every role without its own.
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn role_executor(mut self, role: AgentRole, executor: Arc<dyn TaskExecutor>) -> Self {
        self.role_executors.insert(role, executor);
        self
    }

    pub fn criteria(mut self, criteria: Arc<dyn CriteriaEvaluator>) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn decisions(mut self, decisions: Arc<dyn DecisionProvider>) -> Self {
        self.decisions = Some(decisions);
        self
    }

    /// Use this backend instead of the one `state.data_dir` selects.
    pub fn backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Load persisted state, create the queues, start the event pump and
    /// auto-save, and activate the agents of the current phase.
    pub async fn start(self) -> ConductorResult<Engine> {
        let config = self.config;
        let hub = EventHub::default();

        let backend = match self.backend {
            Some(backend) => backend,
            None => backend_for(&config.state).await?,
        };
        let backend_name = backend.name().to_string();
        let store = Arc::new(
            StateStore::open(backend, config.state.clone())
                .await?
                .with_event_hub(hub.clone()),
        );
        let bus = MessageBus::new(config.bus.clone(), hub.clone());

        let mut queues = Vec::with_capacity(AgentRole::ALL.len());
        for role in AgentRole::ALL {
            let executor = self
                .role_executors
                .get(&role)
                .cloned()
                .or_else(|| self.executor.clone())
                .ok_or_else(|| ConductorError::Config(format!("no executor for {role}")))?;
            queues.push(WorkQueue::new(
                role,
                config.queue_config(role)?,
                executor,
                hub.clone(),
            ));
        }

        let mut builder =
            Orchestrator::builder(config.orchestrator.clone(), store.clone(), bus, hub)
                .queues(queues);
        if let Some(criteria) = self.criteria {
            builder = builder.criteria(criteria);
        }
        if let Some(decisions) = self.decisions {
            builder = builder.decisions(decisions);
        }
        let orchestrator = builder.build()?;

        let mut tasks = vec![orchestrator.start_event_pump()?];
        orchestrator.recover_orphaned_work().await;
        let phase = store.phase().await;
        orchestrator.initialize_phase(phase).await?;
        if config.state.auto_save_interval_secs > 0 {
            tasks.push(store.start_auto_save(config.state.auto_save_interval()));
        }

        info!(phase = %phase, backend = %backend_name, "Engine started");
        Ok(Engine {
            config,
            orchestrator,
            tasks,
        })
    }
}

/// A running engine: an [`Orchestrator`] plus its background tasks.
pub struct Engine {
    config: ConductorConfig,
    orchestrator: Orchestrator,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn builder(config: ConductorConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            executor: None,
            role_executors: HashMap::new(),
            criteria: None,
            decisions: None,
            backend: None,
        }
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Stop background tasks and write the state one last time.
    pub async fn shutdown(self) -> ConductorResult<()> {
        for task in &self.tasks {
            task.abort();
        }
        self.orchestrator.store().save().await?;
        info!("Engine stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = ConductorConfig::load(Path::new("/nonexistent/conductor.toml")).unwrap();
        assert_eq!(config.queue.concurrency, QueueConfig::default().concurrency);
        assert!(config.queue_overrides.is_empty());
    }

    #[test]
    fn test_sections_and_overrides() {
        let config = ConductorConfig::from_toml_str(
            r#"
            [queue]
            concurrency = 2

            [queue_overrides.qa_engineer]
            concurrency = 8
            max_attempts = 1

            [orchestrator]
            strategy = "skill_based"
            max_load_per_agent = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_config(AgentRole::TechLead).unwrap().concurrency, 2);
        let qa = config.queue_config(AgentRole::QaEngineer).unwrap();
        assert_eq!(qa.concurrency, 8);
        assert_eq!(qa.max_attempts, 1);
        assert_eq!(config.orchestrator.max_load_per_agent, 3);
    }

    #[test]
    fn test_unknown_override_role_rejected() {
        let config = ConductorConfig::from_toml_str(
            r#"
            [queue_overrides.astronaut]
            concurrency = 1
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.queue_config(AgentRole::TechLead),
            Err(ConductorError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "[queue\nconcurrency = ").unwrap();
        assert!(matches!(
            ConductorConfig::load(&path),
            Err(ConductorError::Config(_))
        ));
    }
}
