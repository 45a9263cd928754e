use crate::config::QueueConfig;
use crate::executor::{JobContext, TaskExecutor};
use crate::job::{JobRecord, JobState, JobStatus, QueueMetrics, Ticket};
use chrono::Utc;
use conductor_core::{
    AgentRole, ConductorError, ConductorResult, EngineEvent, EventHub, JobId, Priority,
    QueueEvent, Task,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Priority work queue owned by one agent role.
///
/// Jobs run on spawned tokio tasks, at most `concurrency` at a time, in
/// priority order then submission order. Failed attempts are retried with
/// exponential backoff until `max_attempts` is reached.
///
/// Every method that starts work spawns onto the current tokio runtime.
/// Dispatch after `enqueue` is deferred to a spawned task, so tasks queued
/// back to back are ordered by priority before the first one starts.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    role: AgentRole,
    config: QueueConfig,
    executor: Arc<dyn TaskExecutor>,
    hub: EventHub,
    state: Mutex<QueueState>,
    /// Signalled whenever running or pending work shrinks.
    changed: Notify,
    /// Lossless lifecycle listeners, fed before the hub.
    observers: Mutex<Vec<mpsc::UnboundedSender<QueueEvent>>>,
    pump_scheduled: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    /// May hold stale tickets for cancelled or removed jobs; they are skipped.
    waiting: BinaryHeap<Ticket>,
    jobs: HashMap<JobId, JobRecord>,
    active: usize,
    paused: bool,
    next_seq: u64,
    finished_completed: VecDeque<JobId>,
    finished_failed: VecDeque<JobId>,
}

impl QueueState {
    fn count(&self, state: JobState) -> usize {
        self.jobs.values().filter(|j| j.state == state).count()
    }

    fn is_drained(&self) -> bool {
        self.active == 0
            && !self
                .jobs
                .values()
                .any(|j| matches!(j.state, JobState::Waiting | JobState::Delayed))
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Track a finished job and evict the oldest ones past the retention limit.
    fn retain_finished(&mut self, job_id: JobId, state: JobState, config: &QueueConfig) {
        let (list, keep) = match state {
            JobState::Failed => (&mut self.finished_failed, config.keep_failed),
            _ => (&mut self.finished_completed, config.keep_completed),
        };
        list.push_back(job_id);
        let mut evicted = Vec::new();
        while list.len() > keep {
            if let Some(old) = list.pop_front() {
                evicted.push(old);
            }
        }
        for id in evicted {
            if self.jobs.get(&id).is_some_and(|j| j.state.is_finished()) {
                self.jobs.remove(&id);
            }
        }
    }
}

enum Outcome {
    Success(serde_json::Value),
    Failure(String),
    Stalled,
}

impl WorkQueue {
    pub fn new(
        role: AgentRole,
        config: QueueConfig,
        executor: Arc<dyn TaskExecutor>,
        hub: EventHub,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                role,
                config,
                executor,
                hub,
                state: Mutex::new(QueueState::default()),
                changed: Notify::new(),
                observers: Mutex::new(Vec::new()),
                pump_scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn role(&self) -> AgentRole {
        self.inner.role
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Receive every lifecycle event of this queue. Unlike the event hub
    /// this channel never drops events.
    pub fn add_observer(&self, observer: mpsc::UnboundedSender<QueueEvent>) {
        self.inner.observers.lock().push(observer);
    }

    /// Queue a task at the given priority. The task's own priority is updated to match.
    pub fn enqueue(&self, mut task: Task, priority: Priority) -> ConductorResult<JobId> {
        validate(&task)?;
        task.priority = priority;
        let job_id = self.inner.insert(task);
        self.inner.schedule_pump();
        Ok(job_id)
    }

    /// Queue several tasks, each at its own priority, before dispatching any.
    pub fn bulk_enqueue(&self, tasks: Vec<Task>) -> ConductorResult<Vec<JobId>> {
        for task in &tasks {
            validate(task)?;
        }
        let ids = tasks.into_iter().map(|task| self.inner.insert(task)).collect();
        self.inner.schedule_pump();
        Ok(ids)
    }

    pub fn get_status(&self, job_id: JobId) -> ConductorResult<JobStatus> {
        self.inner
            .state
            .lock()
            .jobs
            .get(&job_id)
            .map(JobRecord::status)
            .ok_or_else(|| ConductorError::not_found(format!("job {job_id}")))
    }

    /// Cancel a job. Waiting and delayed jobs are removed outright; a running
    /// job gets its cancellation token triggered and its result discarded.
    /// Returns `false` if the job had already finished.
    pub fn cancel(&self, job_id: JobId) -> ConductorResult<bool> {
        let (task_id, drained) = {
            let mut st = self.inner.state.lock();
            let job = st
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| ConductorError::not_found(format!("job {job_id}")))?;
            let previous = job.state;
            match previous {
                JobState::Completed | JobState::Failed | JobState::Cancelled => return Ok(false),
                JobState::Active => job.cancel.cancel(),
                JobState::Waiting | JobState::Delayed => {}
            }
            job.state = JobState::Cancelled;
            job.finished_at = Some(Utc::now());
            let task_id = job.task.id;
            if previous != JobState::Active {
                st.retain_finished(job_id, JobState::Cancelled, &self.inner.config);
            }
            (task_id, st.is_drained())
        };
        info!(role = %self.inner.role, job_id = %job_id, "Job cancelled");
        self.inner.emit(QueueEvent::Cancelled {
            role: self.inner.role,
            job_id,
            task_id,
        });
        self.inner.after_shrink(drained);
        Ok(true)
    }

    /// Stop starting new jobs. Running jobs are not interrupted.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        info!(role = %self.inner.role, "Queue paused");
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        info!(role = %self.inner.role, "Queue resumed");
        self.inner.pump();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Re-queue every failed job with a fresh attempt budget.
    pub fn retry_failed(&self) -> usize {
        let count = {
            let mut st = self.inner.state.lock();
            let failed: Vec<JobId> = st
                .jobs
                .values()
                .filter(|j| j.state == JobState::Failed)
                .map(|j| j.id)
                .collect();
            for id in &failed {
                let seq = st.next_seq();
                if let Some(job) = st.jobs.get_mut(id) {
                    job.state = JobState::Waiting;
                    job.attempts = 0;
                    job.progress = 0;
                    job.error = None;
                    job.finished_at = None;
                    job.seq = seq;
                    let ticket = job.ticket();
                    st.waiting.push(ticket);
                }
            }
            st.finished_failed.retain(|id| !failed.contains(id));
            failed.len()
        };
        if count > 0 {
            info!(role = %self.inner.role, count, "Retrying failed jobs");
            self.inner.pump();
        }
        count
    }

    pub fn metrics(&self) -> QueueMetrics {
        let st = self.inner.state.lock();
        let waiting = st.count(JobState::Waiting);
        let delayed = st.count(JobState::Delayed);
        QueueMetrics {
            queue_depth: waiting + delayed,
            waiting,
            active: st.active,
            delayed,
            completed: st.count(JobState::Completed),
            failed: st.count(JobState::Failed),
            paused: st.paused,
        }
    }

    /// Remove every waiting job and hand its task back, in dispatch order.
    /// Used to move work off an overloaded agent.
    pub fn take_pending(&self) -> Vec<Task> {
        let (tasks, drained) = {
            let mut st = self.inner.state.lock();
            let mut tickets: Vec<Ticket> = st
                .jobs
                .values()
                .filter(|j| j.state == JobState::Waiting)
                .map(JobRecord::ticket)
                .collect();
            tickets.sort_by(|a, b| b.cmp(a));
            let tasks: Vec<Task> = tickets
                .iter()
                .filter_map(|t| st.jobs.remove(&t.job_id))
                .map(|job| job.task)
                .collect();
            (tasks, st.is_drained())
        };
        if !tasks.is_empty() {
            debug!(role = %self.inner.role, count = tasks.len(), "Pending jobs taken");
        }
        self.inner.after_shrink(drained);
        tasks
    }

    /// Nothing waiting, delayed or running.
    pub fn is_drained(&self) -> bool {
        self.inner.state.lock().is_drained()
    }

    /// Number of running jobs.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Cancel every running job. Returns how many were signalled.
    pub fn cancel_active(&self) -> usize {
        let active: Vec<JobId> = {
            let st = self.inner.state.lock();
            st.jobs
                .values()
                .filter(|j| j.state == JobState::Active)
                .map(|j| j.id)
                .collect()
        };
        active
            .into_iter()
            .filter(|id| self.cancel(*id).unwrap_or(false))
            .count()
    }

    /// Wait until the queue holds no waiting, delayed or running job.
    pub async fn wait_until_drained(&self, timeout: Duration) -> ConductorResult<()> {
        self.wait_for(timeout, "drain", QueueState::is_drained).await
    }

    /// Wait until no job is running. Waiting jobs may remain.
    pub async fn wait_until_idle(&self, timeout: Duration) -> ConductorResult<()> {
        self.wait_for(timeout, "idle", |st| st.active == 0).await
    }

    async fn wait_for(
        &self,
        timeout: Duration,
        what: &str,
        done: impl Fn(&QueueState) -> bool,
    ) -> ConductorResult<()> {
        let wait = async {
            loop {
                let notified = self.inner.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let finished = done(&*self.inner.state.lock());
                if finished {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ConductorError::timeout(timeout, format!("{} queue {what}", self.inner.role))
        })
    }
}

fn validate(task: &Task) -> ConductorResult<()> {
    if task.title.trim().is_empty() {
        return Err(ConductorError::validation("task title must not be empty"));
    }
    if task.dependencies.contains(&task.id) {
        return Err(ConductorError::validation("task cannot depend on itself"));
    }
    Ok(())
}

impl Inner {
    fn emit(&self, event: QueueEvent) {
        self.observers
            .lock()
            .retain(|observer| observer.send(event.clone()).is_ok());
        self.hub.publish(EngineEvent::Queue(event));
    }

    fn insert(&self, task: Task) -> JobId {
        let job_id = Uuid::new_v4();
        let task_id = task.id;
        let priority = task.priority;
        {
            let mut st = self.state.lock();
            let seq = st.next_seq();
            let job = JobRecord::new(job_id, task, priority, seq);
            st.waiting.push(job.ticket());
            st.jobs.insert(job_id, job);
        }
        debug!(role = %self.role, job_id = %job_id, task_id = %task_id, %priority, "Job dispatched");
        self.emit(QueueEvent::Dispatched {
            role: self.role,
            job_id,
            task_id,
            priority,
        });
        job_id
    }

    /// Run [`Inner::pump`] on a spawned task; bursts share one run.
    fn schedule_pump(self: &Arc<Self>) {
        if self.pump_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.pump_scheduled.store(false, Ordering::Release);
            inner.pump();
        });
    }

    /// Start jobs while slots are free and the queue is not paused.
    fn pump(self: &Arc<Self>) {
        let mut launches = Vec::new();
        {
            let mut st = self.state.lock();
            while !st.paused && st.active < self.config.concurrency.max(1) {
                let Some(ticket) = st.waiting.pop() else {
                    break;
                };
                let Some(job) = st.jobs.get_mut(&ticket.job_id) else {
                    continue;
                };
                if job.state != JobState::Waiting || job.seq != ticket.seq {
                    continue;
                }
                job.state = JobState::Active;
                job.attempts += 1;
                job.started_at = Some(Utc::now());
                job.cancel = CancellationToken::new();
                launches.push((job.id, job.task.clone(), job.attempts, job.cancel.clone()));
                st.active += 1;
            }
        }

        for (job_id, task, attempt, cancel) in launches {
            self.emit(QueueEvent::Started {
                role: self.role,
                job_id,
                task_id: task.id,
                attempt,
            });
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run(job_id, task, attempt, cancel).await;
            });
        }
    }

    async fn run(self: Arc<Self>, job_id: JobId, task: Task, attempt: u32, cancel: CancellationToken) {
        let ctx = JobContext::new(
            job_id,
            self.role,
            attempt,
            cancel,
            progress_reporter(Arc::downgrade(&self), job_id),
        );
        debug!(role = %self.role, job_id = %job_id, attempt, "Job started");

        let started = Instant::now();
        let execution = AssertUnwindSafe(self.executor.execute(&task, ctx)).catch_unwind();
        let outcome = match tokio::time::timeout(self.config.job_timeout(), execution).await {
            Ok(Ok(Ok(value))) => Outcome::Success(value),
            Ok(Ok(Err(e))) => Outcome::Failure(e.to_string()),
            Ok(Err(_)) => Outcome::Failure("worker panicked".to_string()),
            Err(_) => Outcome::Stalled,
        };
        self.finish(job_id, attempt, outcome, started.elapsed());
        self.pump();
    }

    fn finish(self: &Arc<Self>, job_id: JobId, attempt: u32, outcome: Outcome, elapsed: Duration) {
        let mut events = Vec::new();
        let mut retry_after = None;
        let drained = {
            let mut st = self.state.lock();
            st.active = st.active.saturating_sub(1);
            let max_attempts = self.config.max_attempts.max(1);
            let mut finished = None;

            if let Some(job) = st.jobs.get_mut(&job_id) {
                let task_id = job.task.id;
                if job.state == JobState::Cancelled {
                    debug!(role = %self.role, job_id = %job_id, "Discarding result of cancelled job");
                    finished = Some(JobState::Cancelled);
                } else {
                    match outcome {
                        Outcome::Success(result) => {
                            job.state = JobState::Completed;
                            job.progress = 100;
                            job.result = Some(result.clone());
                            job.error = None;
                            job.finished_at = Some(Utc::now());
                            finished = Some(JobState::Completed);
                            events.push(QueueEvent::Completed {
                                role: self.role,
                                job_id,
                                task_id,
                                duration_ms: elapsed.as_millis() as u64,
                                result,
                            });
                        }
                        failure => {
                            let error = match failure {
                                Outcome::Failure(e) => e,
                                _ => {
                                    events.push(QueueEvent::Stalled {
                                        role: self.role,
                                        job_id,
                                        task_id,
                                        attempt,
                                    });
                                    format!("job stalled after {:?}", self.config.job_timeout())
                                }
                            };
                            let will_retry = job.attempts < max_attempts;
                            job.error = Some(error.clone());
                            if will_retry {
                                job.state = JobState::Delayed;
                                retry_after = Some(self.config.backoff_delay(job.attempts));
                            } else {
                                job.state = JobState::Failed;
                                job.finished_at = Some(Utc::now());
                                finished = Some(JobState::Failed);
                            }
                            events.push(QueueEvent::Failed {
                                role: self.role,
                                job_id,
                                task_id,
                                attempts: job.attempts,
                                error,
                                will_retry,
                            });
                        }
                    }
                }
            }

            if let Some(state) = finished {
                st.retain_finished(job_id, state, &self.config);
            }
            st.is_drained()
        };

        for event in events {
            match &event {
                QueueEvent::Completed { duration_ms, .. } => {
                    info!(role = %self.role, job_id = %job_id, duration_ms, "Job completed");
                }
                QueueEvent::Failed {
                    attempts,
                    error,
                    will_retry,
                    ..
                } => {
                    if *will_retry {
                        warn!(role = %self.role, job_id = %job_id, attempts, error = %error, "Job failed, retrying");
                    } else {
                        warn!(role = %self.role, job_id = %job_id, attempts, error = %error, "Job failed, attempts exhausted");
                    }
                }
                QueueEvent::Stalled { .. } => {
                    warn!(role = %self.role, job_id = %job_id, attempt, "Job stalled");
                }
                _ => {}
            }
            self.emit(event);
        }

        if let Some(delay) = retry_after {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.requeue(job_id);
            });
        }
        self.after_shrink(drained);
    }

    /// Move a delayed job back to the waiting heap, keeping its original place.
    fn requeue(self: &Arc<Self>, job_id: JobId) {
        {
            let mut st = self.state.lock();
            let Some(job) = st.jobs.get_mut(&job_id) else {
                return;
            };
            if job.state != JobState::Delayed {
                return;
            }
            job.state = JobState::Waiting;
            let ticket = job.ticket();
            st.waiting.push(ticket);
        }
        self.pump();
    }

    fn after_shrink(&self, drained: bool) {
        self.changed.notify_waiters();
        if drained {
            self.emit(QueueEvent::Drained { role: self.role });
        }
    }

    fn report_progress(&self, job_id: JobId, percent: u8) {
        let task_id = {
            let mut st = self.state.lock();
            match st.jobs.get_mut(&job_id) {
                Some(job) if job.state == JobState::Active => {
                    job.progress = percent;
                    job.task.id
                }
                _ => return,
            }
        };
        self.emit(QueueEvent::Progress {
            role: self.role,
            job_id,
            task_id,
            percent,
        });
    }
}

fn progress_reporter(inner: Weak<Inner>, job_id: JobId) -> Arc<dyn Fn(u8) + Send + Sync> {
    Arc::new(move |percent| {
        if let Some(inner) = inner.upgrade() {
            inner.report_progress(job_id, percent);
        }
    })
}
