use crate::config::{OrchestratorConfig, TransitionPolicy};
use crate::conflict::{
    BusDecisionProvider, ConflictContext, ConflictResolution, ConflictResolver, ConflictStrategy,
    DecisionProvider,
};
use crate::criteria::{criterion_key, ContextCriteria, CriteriaEvaluator};
use crate::strategy::{least_loaded, Candidate};
use chrono::Utc;
use conductor_bus::MessageBus;
use conductor_core::{
    AgentRole, AgentRuntimeState, AgentStatus, ConductorError, ConductorResult, EngineEvent, EventHub, JobId,
    MemoryTier, Origin, Phase, Priority, QueueEvent, SnapshotId, SystemState, Task, TaskId,
    TaskStatus,
};
use conductor_queue::WorkQueue;
use conductor_state::StateStore;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Intake form for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Skip strategy selection and assign to this role.
    #[serde(default)]
    pub assignee: Option<AgentRole>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskRequest {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn assigned_to(mut self, role: AgentRole) -> Self {
        self.assignee = Some(role);
        self
    }

    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.dependencies.push(task_id);
        self
    }

    pub fn with_skills<S: Into<String>>(mut self, skills: impl IntoIterator<Item = S>) -> Self {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }
}

/// Outcome of a transition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub from: Phase,
    pub to: Phase,
    pub accepted: bool,
    #[serde(default)]
    pub unmet_criteria: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Snapshot taken before the switch.
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    /// Roles that had to be stopped with work still running.
    #[serde(default)]
    pub forced_deactivations: Vec<AgentRole>,
}

impl TransitionReport {
    fn rejected(from: Phase, to: Phase, unmet: Vec<String>, reason: String) -> Self {
        Self {
            from,
            to,
            accepted: false,
            unmet_criteria: unmet,
            reason: Some(reason),
            snapshot_id: None,
            forced_deactivations: Vec::new(),
        }
    }

    /// Turn a rejection into [`ConductorError::TransitionRejected`].
    pub fn into_result(self) -> ConductorResult<Self> {
        if self.accepted {
            Ok(self)
        } else {
            Err(ConductorError::TransitionRejected(
                self.reason.unwrap_or_else(|| format!("{} -> {}", self.from, self.to)),
            ))
        }
    }
}

/// Exit-criterion status of the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionStatus {
    pub name: String,
    pub met: bool,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, Task>,
    jobs: HashMap<TaskId, (AgentRole, JobId)>,
    /// Tasks waiting on dependencies, with their requested assignee.
    held: Vec<(TaskId, Option<AgentRole>)>,
    /// Attempts and last error of tasks whose retries ran out.
    failures: HashMap<TaskId, (u32, String)>,
}

impl Registry {
    fn completed(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect()
    }

    /// Mark `task` as handed to its assignee, keeping the stored copy when
    /// it has already finished.
    fn record_assignment(&mut self, task: &Task) {
        self.jobs.remove(&task.id);
        self.failures.remove(&task.id);
        match self.tasks.get_mut(&task.id) {
            Some(existing) if existing.status.is_terminal() => {}
            Some(existing) => {
                existing.assigned_to = task.assigned_to;
                existing.set_status(TaskStatus::Pending);
            }
            None => {
                self.tasks.insert(task.id, task.clone());
            }
        }
    }

    /// Tasks that hold a slot on some agent.
    fn live_by_role(&self) -> HashMap<AgentRole, Vec<TaskId>> {
        let mut live: HashMap<AgentRole, Vec<TaskId>> = HashMap::new();
        for (task_id, (role, _)) in &self.jobs {
            let running = self
                .tasks
                .get(task_id)
                .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress));
            if running {
                live.entry(*role).or_default().push(*task_id);
            }
        }
        live
    }

    /// Held tasks whose dependencies are now all complete.
    fn take_released(&mut self) -> Vec<(Task, Option<AgentRole>)> {
        let completed = self.completed();
        let mut released = Vec::new();
        let mut still_held = Vec::new();
        for (id, assignee) in std::mem::take(&mut self.held) {
            match self.tasks.get(&id) {
                Some(task) if task.dependencies.iter().all(|d| completed.contains(d)) => {
                    released.push((task.clone(), assignee));
                }
                Some(task) if task.status == TaskStatus::Cancelled => {}
                Some(_) => still_held.push((id, assignee)),
                None => {}
            }
        }
        self.held = still_held;
        released
    }
}

/// Assembles an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Arc<StateStore>,
    bus: MessageBus,
    hub: EventHub,
    queues: BTreeMap<AgentRole, WorkQueue>,
    criteria: Option<Arc<dyn CriteriaEvaluator>>,
    decisions: Option<Arc<dyn DecisionProvider>>,
}

impl OrchestratorBuilder {
    pub fn queue(mut self, queue: WorkQueue) -> Self {
        self.queues.insert(queue.role(), queue);
        self
    }

    pub fn queues(mut self, queues: impl IntoIterator<Item = WorkQueue>) -> Self {
        for queue in queues {
            self.queues.insert(queue.role(), queue);
        }
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

    /// Fails unless every roster role has a queue.
    pub fn build(self) -> ConductorResult<Orchestrator> {
        let missing: Vec<&str> = AgentRole::ALL
            .iter()
            .filter(|r| !self.queues.contains_key(*r))
            .map(AgentRole::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ConductorError::Config(format!(
                "no work queue for: {}",
                missing.join(", ")
            )));
        }

        let decisions = self.decisions.unwrap_or_else(|| {
            let timeout = self.bus.config().default_request_timeout();
            Arc::new(BusDecisionProvider::new(self.bus.clone(), timeout))
        });
        let (observer, queue_events) = mpsc::unbounded_channel();
        for queue in self.queues.values() {
            queue.add_observer(observer.clone());
        }
        let conflicts = ConflictResolver::new(
            decisions,
            self.hub.clone(),
            self.config.seniority.clone(),
            self.config.max_consensus_rounds,
        );
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                criteria: self.criteria.unwrap_or_else(|| Arc::new(ContextCriteria)),
                config: self.config,
                store: self.store,
                bus: self.bus,
                hub: self.hub,
                queues: self.queues,
                conflicts,
                registry: Mutex::new(Registry::default()),
                cursor: Mutex::new(0),
                assign_lock: tokio::sync::Mutex::new(()),
                transition_lock: tokio::sync::Mutex::new(()),
                task_changed: Notify::new(),
                queue_events: Mutex::new(Some(queue_events)),
            }),
        })
    }
}

/// Drives the workflow: phases, task assignment, redistribution and
/// conflict resolution, on top of the role queues, bus and state store.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    store: Arc<StateStore>,
    bus: MessageBus,
    hub: EventHub,
    queues: BTreeMap<AgentRole, WorkQueue>,
    criteria: Arc<dyn CriteriaEvaluator>,
    conflicts: ConflictResolver,
    registry: Mutex<Registry>,
    cursor: Mutex<usize>,
    /// Serializes assignment so load figures stay consistent.
    assign_lock: tokio::sync::Mutex<()>,
    transition_lock: tokio::sync::Mutex<()>,
    task_changed: Notify,
    /// Lifecycle events of every queue, taken by the event pump.
    queue_events: Mutex<Option<mpsc::UnboundedReceiver<QueueEvent>>>,
}

impl Orchestrator {
    pub fn builder(
        config: OrchestratorConfig,
        store: Arc<StateStore>,
        bus: MessageBus,
        hub: EventHub,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store,
            bus,
            hub,
            queues: BTreeMap::new(),
            criteria: None,
            decisions: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    pub fn queue(&self, role: AgentRole) -> ConductorResult<&WorkQueue> {
        self.inner.queue(role)
    }

    pub async fn current_phase(&self) -> Phase {
        self.inner.store.phase().await
    }

    /// Start consuming queue and bus events into the state store.
    ///
    /// Queue events arrive on a channel that never drops them; the event
    /// hub only feeds message metrics. Can be started once. The pump stops
    /// once the orchestrator is dropped or the handle aborted.
    pub fn start_event_pump(&self) -> ConductorResult<JoinHandle<()>> {
        let mut queue_events = self
            .inner
            .queue_events
            .lock()
            .take()
            .ok_or_else(|| ConductorError::validation("event pump already started"))?;
        let mut events = self.inner.hub.subscribe();
        let mut hub_open = true;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = queue_events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.handle_queue_event(event).await;
                    }
                    event = events.recv(), if hub_open => {
                        let Some(event) = event else {
                            hub_open = false;
                            continue;
                        };
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.handle_event(event).await;
                    }
                }
            }
            debug!("Event pump stopped");
        }))
    }

    /// Rebuild every agent's task list from the work this orchestrator is
    /// tracking. Ids left over from an earlier run are dropped. Returns how
    /// many were dropped.
    pub async fn recover_orphaned_work(&self) -> usize {
        let _guard = self.inner.assign_lock.lock().await;
        self.inner.reconcile_loads().await
    }

    /// Restore a snapshot and re-apply its phase to the queues.
    /// Returns the roles that were force-stopped.
    pub async fn restore_snapshot(&self, id: SnapshotId) -> ConductorResult<Vec<AgentRole>> {
        let _guard = self
            .inner
            .transition_lock
            .try_lock()
            .map_err(|_| ConductorError::TransitionInProgress)?;
        let previous = self.inner.store.active_agents().await;
        self.inner.store.restore_snapshot(id).await?;
        self.inner.store.set_active_agents(previous).await;
        {
            let _assign = self.inner.assign_lock.lock().await;
            self.inner.reconcile_loads().await;
        }
        let phase = self.inner.store.phase().await;
        let forced = self.inner.apply_phase(phase).await;
        info!(snapshot_id = %id, phase = %phase, "Snapshot applied");
        Ok(forced)
    }

    // --- Phases ---

    /// Activate the roles of `phase` and deactivate everyone else.
    pub async fn initialize_phase(&self, phase: Phase) -> ConductorResult<Vec<AgentRole>> {
        let _guard = self
            .inner
            .transition_lock
            .try_lock()
            .map_err(|_| ConductorError::TransitionInProgress)?;
        let forced = self.inner.apply_phase(phase).await;
        if self.inner.store.phase().await == phase {
            self.inner.store.modify(|s| s.phase = phase).await;
        } else {
            self.inner.store.set_phase(phase).await;
        }
        info!(phase = %phase, "Phase initialized");
        Ok(forced)
    }

    /// Move to `to` once the current phase's exit criteria hold.
    ///
    /// A rejection is returned as a report with `accepted == false`; use
    /// [`TransitionReport::into_result`] to treat it as an error.
    pub async fn transition_phase(&self, to: Phase) -> ConductorResult<TransitionReport> {
        let _guard = self
            .inner
            .transition_lock
            .try_lock()
            .map_err(|_| ConductorError::TransitionInProgress)?;
        let inner = &self.inner;
        let from = inner.store.phase().await;

        let unmet: Vec<String> = inner
            .evaluate_criteria(from)
            .await?
            .into_iter()
            .filter(|c| !c.met)
            .map(|c| c.name)
            .collect();
        let rejection = if !unmet.is_empty() {
            Some(format!("unmet exit criteria of {from}: {}", unmet.join(", ")))
        } else if to == from {
            Some(format!("already in {from}"))
        } else if inner.config.transition_policy == TransitionPolicy::Sequential && to != from.next() {
            Some(format!("sequential policy only allows {from} -> {}", from.next()))
        } else {
            None
        };
        if let Some(reason) = rejection {
            warn!(from = %from, to = %to, reason = %reason, "Phase transition rejected");
            inner.hub.publish(EngineEvent::TransitionRejected {
                from,
                to,
                reason: reason.clone(),
            });
            return Ok(TransitionReport::rejected(from, to, unmet, reason));
        }

        let active = inner.store.active_agents().await;
        let timeout = inner.config.drain_timeout();
        let drains = join_all(
            active
                .iter()
                .filter_map(|role| inner.queues.get(role))
                .map(|q| q.wait_until_drained(timeout)),
        )
        .await;
        if let Some(err) = drains.into_iter().find_map(Result::err) {
            warn!(from = %from, to = %to, error = %err, "Queues did not drain, phase unchanged");
            return Err(err);
        }

        let snapshot_id = inner
            .store
            .create_snapshot(format!("before transition {from} -> {to}"))
            .await;
        let forced = inner.apply_phase(to).await;
        inner.store.modify(|s| s.phase = to).await;

        info!(from = %from, to = %to, forced = forced.len(), "Phase transitioned");
        inner.hub.publish(EngineEvent::PhaseTransitioned {
            from,
            to,
            at: Utc::now(),
        });
        Ok(TransitionReport {
            from,
            to,
            accepted: true,
            unmet_criteria: Vec::new(),
            reason: None,
            snapshot_id: Some(snapshot_id),
            forced_deactivations: forced,
        })
    }

    /// Status of every exit criterion of the current phase.
    pub async fn exit_criteria_status(&self) -> ConductorResult<Vec<CriterionStatus>> {
        let phase = self.inner.store.phase().await;
        self.inner.evaluate_criteria(phase).await
    }

    /// Record whether a named criterion holds (read by [`ContextCriteria`]).
    pub async fn set_criterion(&self, name: &str, met: bool) {
        self.inner
            .store
            .update_global_context(criterion_key(name), serde_json::Value::Bool(met))
            .await;
    }

    // --- Tasks ---

    /// Validate and register a task, then assign it or hold it until its
    /// dependencies complete.
    pub async fn submit_task(&self, request: TaskRequest) -> ConductorResult<Task> {
        if request.title.trim().is_empty() {
            return Err(ConductorError::validation("task title must not be empty"));
        }
        let mut task = Task::new(request.title, request.assignee.unwrap_or(AgentRole::TechLead))
            .with_description(request.description)
            .with_priority(request.priority)
            .with_dependencies(request.dependencies)
            .with_skills(request.required_skills);
        task.metadata = request.metadata;

        let waiting_on: Vec<TaskId> = {
            let mut registry = self.inner.registry.lock();
            if let Some(unknown) = task
                .dependencies
                .iter()
                .find(|d| !registry.tasks.contains_key(*d))
            {
                return Err(ConductorError::validation(format!(
                    "unknown dependency {unknown}"
                )));
            }
            let waiting_on: Vec<TaskId> = task
                .dependencies
                .iter()
                .filter(|d| {
                    registry
                        .tasks
                        .get(*d)
                        .is_some_and(|t| t.status != TaskStatus::Completed)
                })
                .copied()
                .collect();
            if !waiting_on.is_empty() {
                task.set_status(TaskStatus::Blocked);
                registry.held.push((task.id, request.assignee));
            }
            registry.tasks.insert(task.id, task.clone());
            waiting_on
        };

        if !waiting_on.is_empty() {
            info!(task_id = %task.id, waiting_on = waiting_on.len(), "Task held for dependencies");
            return Ok(task);
        }
        self.inner.assign_task(task, request.assignee).await
    }

    /// Pick an agent for `task` (or use `assignee`) and enqueue it.
    pub async fn assign_task(
        &self,
        task: Task,
        assignee: Option<AgentRole>,
    ) -> ConductorResult<Task> {
        self.inner.assign_task(task, assignee).await
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.registry.lock().tasks.get(&task_id).cloned()
    }

    /// Every known task, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.registry.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Cancel a task wherever it is: held, queued or running.
    pub async fn cancel_task(&self, task_id: TaskId) -> ConductorResult<bool> {
        let job = {
            let mut registry = self.inner.registry.lock();
            let task = registry
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| ConductorError::not_found(format!("task {task_id}")))?;
            if task.status.is_terminal() {
                return Ok(false);
            }
            let job = registry.jobs.get(&task_id).copied();
            if job.is_none() {
                if let Some(task) = registry.tasks.get_mut(&task_id) {
                    task.set_status(TaskStatus::Cancelled);
                }
                registry.held.retain(|(id, _)| *id != task_id);
            }
            job
        };
        match job {
            Some((role, job_id)) => self.inner.queue(role)?.cancel(job_id),
            None => {
                self.inner.task_changed.notify_waiters();
                Ok(true)
            }
        }
    }

    /// Wait until a task completes, is cancelled, or fails for good.
    ///
    /// A task whose retries ran out yields [`ConductorError::RetryExhausted`].
    pub async fn wait_for_task(&self, task_id: TaskId, timeout: Duration) -> ConductorResult<Task> {
        let wait = async {
            loop {
                let notified = self.inner.task_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let (current, failure) = {
                    let registry = self.inner.registry.lock();
                    (
                        registry.tasks.get(&task_id).cloned(),
                        registry.failures.get(&task_id).cloned(),
                    )
                };
                match current {
                    None => return Err(ConductorError::not_found(format!("task {task_id}"))),
                    Some(task) if task.status.is_terminal() => return Ok(task),
                    Some(task) if task.status == TaskStatus::Blocked && task.error.is_some() => {
                        return match failure {
                            Some((attempts, reason)) => {
                                Err(ConductorError::RetryExhausted { attempts, reason })
                            }
                            None => Ok(task),
                        };
                    }
                    Some(_) => {}
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ConductorError::timeout(timeout, format!("task {task_id}")))?
    }

    /// Wait until every task is finished or failed for good.
    pub async fn wait_for_all(&self, timeout: Duration) -> ConductorResult<()> {
        let wait = async {
            loop {
                let notified = self.inner.task_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let settled = self.inner.registry.lock().tasks.values().all(|t| {
                    t.status.is_terminal() || (t.status == TaskStatus::Blocked && t.error.is_some())
                });
                if settled {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ConductorError::timeout(timeout, "all tasks"))
    }

    /// Move waiting work off `role` onto the least-loaded alternatives.
    /// Returns how many tasks moved.
    pub async fn handle_overload(&self, role: AgentRole) -> ConductorResult<usize> {
        let _guard = self.inner.assign_lock.lock().await;
        self.inner.redistribute(role).await
    }

    // --- Agents ---

    pub async fn pause_agent(&self, role: AgentRole) -> ConductorResult<()> {
        self.inner.queue(role)?.pause();
        self.inner
            .store
            .modify_agent(role, |a| a.status = AgentStatus::Paused)
            .await;
        info!(role = %role, "Agent paused");
        Ok(())
    }

    pub async fn resume_agent(&self, role: AgentRole) -> ConductorResult<()> {
        let queue = self.inner.queue(role)?;
        let active = self.inner.store.active_agents().await.contains(&role);
        if active {
            queue.resume();
        }
        let busy = queue.active_count() > 0;
        self.inner
            .store
            .modify_agent(role, |a| {
                a.status = if busy { AgentStatus::Working } else { AgentStatus::Idle };
            })
            .await;
        info!(role = %role, active, "Agent resumed");
        Ok(())
    }

    pub async fn get_agent_memory(
        &self,
        role: AgentRole,
        tier: MemoryTier,
    ) -> HashMap<String, serde_json::Value> {
        self.inner.store.get_agent_memory(role, tier).await
    }

    pub async fn update_agent_memory(
        &self,
        role: AgentRole,
        tier: MemoryTier,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        self.inner
            .store
            .update_agent_memory(role, tier, key, value)
            .await;
    }

    pub async fn system_state(&self) -> SystemState {
        self.inner.store.get_system_state().await
    }

    // --- Conflicts ---

    /// Settle a disagreement using the configured strategy.
    pub async fn resolve_conflict(
        &self,
        roles: &[AgentRole],
        context: ConflictContext,
    ) -> ConductorResult<ConflictResolution> {
        self.resolve_conflict_with(self.inner.config.conflict_strategy, roles, context)
            .await
    }

    pub async fn resolve_conflict_with(
        &self,
        strategy: ConflictStrategy,
        roles: &[AgentRole],
        context: ConflictContext,
    ) -> ConductorResult<ConflictResolution> {
        self.inner.conflicts.resolve(strategy, roles, &context).await
    }

    pub fn resolve_escalation(
        &self,
        escalation_id: Uuid,
        decision: serde_json::Value,
    ) -> ConductorResult<()> {
        self.inner.conflicts.resolve_escalation(escalation_id, decision)
    }

    pub fn pending_escalations(&self) -> Vec<Uuid> {
        self.inner.conflicts.pending_escalations()
    }
}

impl Inner {
    fn queue(&self, role: AgentRole) -> ConductorResult<&WorkQueue> {
        self.queues
            .get(&role)
            .ok_or_else(|| ConductorError::not_found(format!("queue for {role}")))
    }

    async fn evaluate_criteria(&self, phase: Phase) -> ConductorResult<Vec<CriterionStatus>> {
        let state = self.store.get_system_state().await;
        let mut statuses = Vec::new();
        for name in phase.definition().exit_criteria {
            let met = self.criteria.is_met(phase, name, &state).await?;
            statuses.push(CriterionStatus {
                name: (*name).to_string(),
                met,
            });
        }
        Ok(statuses)
    }

    /// Deactivate roles outside `phase`, activate its roles. Returns the
    /// roles that were force-stopped.
    async fn apply_phase(&self, phase: Phase) -> Vec<AgentRole> {
        let next: BTreeSet<AgentRole> = phase.definition().active_roles.iter().copied().collect();
        let previous = self.store.active_agents().await;

        let leaving: Vec<AgentRole> = AgentRole::ALL
            .iter()
            .copied()
            .filter(|r| !next.contains(r))
            .collect();
        let outcomes = join_all(
            leaving
                .iter()
                .map(|role| self.deactivate(*role, phase, previous.contains(role))),
        )
        .await;
        let forced: Vec<AgentRole> = leaving
            .into_iter()
            .zip(outcomes)
            .filter_map(|(role, forced)| forced.then_some(role))
            .collect();

        let state = self.store.get_system_state().await;
        for role in &next {
            let paused = state
                .agent(*role)
                .is_some_and(|a| a.status == AgentStatus::Paused);
            let queue = self.queues.get(role);
            if !paused {
                if let Some(queue) = queue {
                    queue.resume();
                }
                let busy = queue.is_some_and(|q| q.active_count() > 0);
                self.store
                    .modify_agent(*role, |a| {
                        a.status = if busy { AgentStatus::Working } else { AgentStatus::Idle };
                    })
                    .await;
            }
            if !previous.contains(role) {
                debug!(role = %role, phase = %phase, "Agent activated");
                self.hub.publish(EngineEvent::AgentActivated { role: *role, phase });
            }
        }
        self.store.set_active_agents(next).await;
        forced
    }

    /// Pause a role's queue and let running work finish. Returns `true`
    /// when the role had to be force-stopped.
    async fn deactivate(&self, role: AgentRole, phase: Phase, was_active: bool) -> bool {
        let Ok(queue) = self.queue(role) else {
            return false;
        };
        queue.pause();
        let mut forced = false;
        if queue
            .wait_until_idle(self.config.deactivation_timeout())
            .await
            .is_err()
        {
            let cancelled = queue.cancel_active();
            warn!(role = %role, phase = %phase, cancelled, "Agent force-stopped");
            forced = true;
            if queue.wait_until_idle(self.config.deactivation_timeout()).await.is_err() {
                warn!(role = %role, "Cancelled work is still running");
            }
        }
        self.store
            .modify_agent(role, |a| {
                if a.status != AgentStatus::Paused {
                    a.status = AgentStatus::Idle;
                }
            })
            .await;
        if was_active {
            info!(role = %role, phase = %phase, forced, "Agent deactivated");
            self.hub
                .publish(EngineEvent::AgentDeactivated { role, phase, forced });
        }
        forced
    }

    async fn candidates(&self, exclude: Option<AgentRole>) -> Vec<Candidate> {
        let state = self.store.get_system_state().await;
        AgentRole::ALL
            .iter()
            .copied()
            .filter(|r| Some(*r) != exclude && state.active_agents.contains(r))
            .filter_map(|r| state.agent(r))
            .filter(|a| a.status != AgentStatus::Paused && a.load() < self.config.max_load_per_agent)
            .map(|a| Candidate {
                role: a.role,
                load: a.load(),
                quality: a.metrics.quality_score,
            })
            .collect()
    }

    /// Caller holds `assign_lock`.
    async fn reconcile_loads(&self) -> usize {
        let live = self.registry.lock().live_by_role();
        let dropped = self
            .store
            .modify(|state| {
                let mut dropped = 0;
                for (role, agent) in state.agents.iter_mut() {
                    let keep = live.get(role).cloned().unwrap_or_default();
                    dropped += agent
                        .current_tasks
                        .iter()
                        .filter(|id| !keep.contains(id))
                        .count();
                    agent.current_tasks = keep;
                    if agent.current_tasks.is_empty() && agent.status == AgentStatus::Working {
                        agent.status = AgentStatus::Idle;
                    }
                }
                dropped
            })
            .await;
        if dropped > 0 {
            warn!(dropped, "Dropped agent tasks with no tracked work");
        }
        dropped
    }

    async fn assign_task(&self, mut task: Task, assignee: Option<AgentRole>) -> ConductorResult<Task> {
        let _guard = self.assign_lock.lock().await;
        let role = match assignee {
            Some(role) => role,
            None => {
                let candidates = self.candidates(None).await;
                let pick = {
                    let mut cursor = self.cursor.lock();
                    self.config.strategy.select(&task, &candidates, &mut cursor)
                };
                pick.ok_or_else(|| {
                    ConductorError::NoAvailableAgent(format!(
                        "no eligible agent for '{}' ({:?} strategy)",
                        task.title, self.config.strategy
                    ))
                })?
            }
        };

        task.assigned_to = role;
        task.set_status(TaskStatus::Pending);
        let priority = task.priority;
        let queue = self.queue(role)?;
        self.registry.lock().record_assignment(&task);
        let load = self
            .store
            .modify_agent(role, |a| {
                a.assign(task.id);
                a.load()
            })
            .await;
        let job_id = match queue.enqueue(task.clone(), priority) {
            Ok(job_id) => job_id,
            Err(e) => {
                self.store.modify_agent(role, |a| a.release(task.id)).await;
                self.update_task(task.id, |t| {
                    t.error = Some(e.to_string());
                    t.set_status(TaskStatus::Blocked);
                });
                return Err(e);
            }
        };
        self.registry.lock().jobs.insert(task.id, (role, job_id));

        info!(task_id = %task.id, role = %role, job_id = %job_id, %priority, "Task assigned");
        self.hub.publish(EngineEvent::TaskAssigned {
            task_id: task.id,
            role,
            job_id: Some(job_id),
        });

        if load > self.config.max_load_per_agent {
            warn!(role = %role, load, "Agent overloaded");
            self.hub.publish(EngineEvent::AgentOverloaded { role, load });
            if self.config.auto_redistribute {
                if let Err(e) = self.redistribute(role).await {
                    warn!(role = %role, error = %e, "Redistribution failed");
                }
            }
        }
        Ok(task)
    }

    /// Caller holds `assign_lock`.
    async fn redistribute(&self, role: AgentRole) -> ConductorResult<usize> {
        let queue = self.queue(role)?;
        let pending = queue.take_pending();
        if pending.is_empty() {
            return Ok(0);
        }
        let mut moved = 0;
        for mut task in pending {
            let candidates = self.candidates(Some(role)).await;
            let skilled: Vec<Candidate> = candidates
                .iter()
                .copied()
                .filter(|c| c.role.has_skills(&task.required_skills))
                .collect();
            let target = least_loaded(skilled.iter()).or_else(|| least_loaded(candidates.iter()));

            let to = target.unwrap_or(role);
            task.assigned_to = to;
            if to != role {
                self.store.modify_agent(role, |a| a.release(task.id)).await;
                self.store.modify_agent(to, |a| a.assign(task.id)).await;
            }
            self.registry.lock().record_assignment(&task);
            let job_id = self.queue(to)?.enqueue(task.clone(), task.priority)?;
            self.registry.lock().jobs.insert(task.id, (to, job_id));
            if to == role {
                continue;
            }
            moved += 1;
            info!(task_id = %task.id, from = %role, to = %to, "Task redistributed");
            self.hub.publish(EngineEvent::TaskRedistributed {
                task_id: task.id,
                from: role,
                to,
            });
        }
        Ok(moved)
    }

    async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::MessagePublished {
                from: Origin::Agent(role),
                ..
            } => {
                self.store
                    .modify_agent(role, |a| a.metrics.record_message_sent())
                    .await;
            }
            _ => {}
        }
    }

    /// Events of jobs replaced by redistribution are ignored. A job not yet
    /// recorded counts as current.
    fn is_current(&self, task_id: TaskId, job_id: JobId) -> bool {
        self.registry
            .lock()
            .jobs
            .get(&task_id)
            .map_or(true, |(_, j)| *j == job_id)
    }

    async fn handle_queue_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Started {
                role,
                job_id,
                task_id,
                ..
            } => {
                if !self.is_current(task_id, job_id) {
                    return;
                }
                self.registry.lock().failures.remove(&task_id);
                self.update_task(task_id, |t| t.set_status(TaskStatus::InProgress));
                self.store
                    .modify_agent(role, |a| {
                        if a.status != AgentStatus::Paused {
                            a.status = AgentStatus::Working;
                        }
                    })
                    .await;
            }
            QueueEvent::Completed {
                role,
                job_id,
                task_id,
                duration_ms,
                result,
            } => {
                if !self.is_current(task_id, job_id) {
                    return;
                }
                self.update_task(task_id, |t| {
                    t.result = Some(result);
                    t.error = None;
                    t.set_status(TaskStatus::Completed);
                });
                let busy = self.queues.get(&role).is_some_and(|q| q.active_count() > 0);
                self.store
                    .modify_agent(role, |a| {
                        a.release(task_id);
                        a.metrics.record_completion(duration_ms);
                        settle_status(a, busy);
                    })
                    .await;
                self.release_dependents().await;
            }
            QueueEvent::Failed {
                role,
                job_id,
                task_id,
                attempts,
                error,
                will_retry: false,
            } => {
                if !self.is_current(task_id, job_id) {
                    return;
                }
                warn!(task_id = %task_id, role = %role, attempts, "Task failed after retries");
                let exhausted = ConductorError::RetryExhausted {
                    attempts,
                    reason: error.clone(),
                }
                .to_string();
                self.registry
                    .lock()
                    .failures
                    .insert(task_id, (attempts, error));
                self.update_task(task_id, |t| {
                    t.error = Some(exhausted);
                    t.set_status(TaskStatus::Blocked);
                });
                let busy = self.queues.get(&role).is_some_and(|q| q.active_count() > 0);
                self.store
                    .modify_agent(role, |a| {
                        a.release(task_id);
                        a.metrics.record_failure();
                        settle_status(a, busy);
                    })
                    .await;
            }
            QueueEvent::Cancelled {
                role,
                job_id,
                task_id,
            } => {
                if !self.is_current(task_id, job_id) {
                    return;
                }
                self.update_task(task_id, |t| t.set_status(TaskStatus::Cancelled));
                let busy = self.queues.get(&role).is_some_and(|q| q.active_count() > 0);
                self.store
                    .modify_agent(role, |a| {
                        a.release(task_id);
                        settle_status(a, busy);
                    })
                    .await;
            }
            _ => {}
        }
    }

    fn update_task(&self, task_id: TaskId, f: impl FnOnce(&mut Task)) {
        if let Some(task) = self.registry.lock().tasks.get_mut(&task_id) {
            f(task);
        }
        self.task_changed.notify_waiters();
    }

    async fn release_dependents(&self) {
        let released = self.registry.lock().take_released();
        for (task, assignee) in released {
            let task_id = task.id;
            debug!(task_id = %task_id, "Dependencies complete, releasing task");
            if let Err(e) = self.assign_task(task, assignee).await {
                warn!(task_id = %task_id, error = %e, "Released task could not be assigned");
                self.update_task(task_id, |t| t.error = Some(e.to_string()));
            }
        }
    }
}

fn settle_status(agent: &mut AgentRuntimeState, busy: bool) {
    if agent.status != AgentStatus::Paused {
        agent.status = if busy { AgentStatus::Working } else { AgentStatus::Idle };
    }
}
