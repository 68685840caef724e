//! Swarm coordinator: objective intake, the agent registry and the
//! single-threaded scheduling loop that owns all task and agent state.
//!
//! Readers take the state read lock briefly; only the loop thread (and the
//! synchronous intake calls) write it. Agent workers never touch the state:
//! they report attempts back over the loop channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{FailurePolicy, SwarmConfig};
use crate::coordination::CoordinationManager;
use crate::decompose;
use crate::error::{SwarmError, SwarmResult};
use crate::events::{now_ms, EventBus, SwarmEvent};
use crate::executor::{ExecutionContext, ExecutionOptions, ExecutionOutput, TaskExecutor, TaskHandler};
use crate::memory::MemoryStore;
use crate::model::{
    new_id, Agent, AgentCapabilities, AgentId, AgentStatus, Objective, ObjectiveId,
    ObjectiveOutcome, ObjectiveRequirements, ObjectiveStatus, Strategy, SwarmMetrics, SwarmStatus,
    Task, TaskId, TaskStatus,
};
use crate::scheduler::{self, Assignment, ObjectiveSlots, SchedulingPolicy};
use crate::snapshot::{SnapshotData, SnapshotWriter, StatusSnapshot};
use crate::sync::{lock, read, write};
use crate::worker::{AgentWorker, Completion, Dispatch, LoopMessage};

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Memory namespace holding an objective's task results.
pub fn result_namespace(objective_id: &str) -> String {
    format!("objective/{objective_id}")
}

/// Memory key of one task's result inside its objective namespace.
pub fn result_key(task_name: &str) -> String {
    format!("task/{task_name}")
}

/// Task handlers keyed by task type, with an optional fallback.
#[derive(Default)]
pub struct HandlerRegistry {
    by_type: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    fallback: RwLock<Option<Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        write(&self.by_type).insert(task_type.trim().to_lowercase(), handler);
    }

    pub fn set_default(&self, handler: Arc<dyn TaskHandler>) {
        *write(&self.fallback) = Some(handler);
    }

    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        read(&self.by_type)
            .get(&task_type.trim().to_lowercase())
            .cloned()
            .or_else(|| read(&self.fallback).clone())
    }
}

fn missing_handler() -> Arc<dyn TaskHandler> {
    Arc::new(|task: &Task, _: &ExecutionContext| -> SwarmResult<String> {
        Err(SwarmError::NoHandler(task.task_type.clone()))
    })
}

#[derive(Debug, Default)]
struct MetricsAcc {
    objectives_created: u64,
    objectives_completed: u64,
    objectives_failed: u64,
    tasks_dispatched: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    tasks_retried: u64,
    tasks_cancelled: u64,
    work_steals: u64,
    scheduler_ticks: u64,
    attempts_finished: u64,
    attempt_ms_total: u64,
}

#[derive(Default)]
struct SwarmState {
    objectives: HashMap<ObjectiveId, Objective>,
    deadlines: HashMap<ObjectiveId, Instant>,
    timed_out: HashSet<ObjectiveId>,
    tasks: HashMap<TaskId, Task>,
    agents: Vec<Agent>,
    idle_ticks: HashMap<AgentId, u32>,
    rr_cursor: Option<u64>,
    next_task_seq: u64,
    next_agent_seq: u64,
    metrics: MetricsAcc,
}

impl SwarmState {
    fn objective_tasks<'a>(&'a self, objective_id: &str) -> impl Iterator<Item = &'a Task> + 'a {
        self.objectives
            .get(objective_id)
            .into_iter()
            .flat_map(move |o| o.task_ids.iter().filter_map(move |id| self.tasks.get(id)))
    }

    /// Executing, unsettled and within its wall-clock budget.
    fn is_dispatchable(&self, objective_id: &str) -> bool {
        self.objectives
            .get(objective_id)
            .map(|o| o.status == ObjectiveStatus::Executing && o.outcome.is_none())
            .unwrap_or(false)
            && !self.timed_out.contains(objective_id)
    }

    fn status(&self) -> SwarmStatus {
        let mut s = SwarmStatus {
            total_tasks: self.tasks.len(),
            total_agents: self.agents.len(),
            active_agents: self
                .agents
                .iter()
                .filter(|a| a.status == AgentStatus::Busy)
                .count(),
            ..SwarmStatus::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => s.pending_tasks += 1,
                TaskStatus::Queued => s.queued_tasks += 1,
                TaskStatus::Running => s.active_tasks += 1,
                TaskStatus::Completed => s.completed_tasks += 1,
                TaskStatus::Failed => s.failed_tasks += 1,
                TaskStatus::Cancelled => s.cancelled_tasks += 1,
            }
        }
        s
    }

    fn metrics(&self, uptime: Duration) -> SwarmMetrics {
        let m = &self.metrics;
        SwarmMetrics {
            objectives_created: m.objectives_created,
            objectives_completed: m.objectives_completed,
            objectives_failed: m.objectives_failed,
            tasks_dispatched: m.tasks_dispatched,
            tasks_completed: m.tasks_completed,
            tasks_failed: m.tasks_failed,
            tasks_retried: m.tasks_retried,
            tasks_cancelled: m.tasks_cancelled,
            work_steals: m.work_steals,
            scheduler_ticks: m.scheduler_ticks,
            avg_task_duration_ms: if m.attempts_finished == 0 {
                0.0
            } else {
                m.attempt_ms_total as f64 / m.attempts_finished as f64
            },
            uptime_ms: uptime.as_millis() as u64,
        }
    }

    fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    fn sorted_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    fn sorted_objectives(&self) -> Vec<Objective> {
        let mut objectives: Vec<Objective> = self.objectives.values().cloned().collect();
        objectives.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        objectives
    }
}

struct Shared {
    config: SwarmConfig,
    policy: SchedulingPolicy,
    state: RwLock<SwarmState>,
    events: EventBus,
    handlers: HandlerRegistry,
    executor: Arc<TaskExecutor>,
    memory: Arc<MemoryStore>,
    coordination: Arc<CoordinationManager>,
    workers: Mutex<HashMap<AgentId, AgentWorker>>,
    loop_tx: Mutex<Sender<LoopMessage>>,
    accepting: AtomicBool,
    started: Instant,
}

impl Shared {
    fn wake(&self) {
        let _ = lock(&self.loop_tx).send(LoopMessage::Wake);
    }

    fn snapshot(&self) -> SnapshotData {
        let st = read(&self.state);
        let mut agents = st.agents.clone();
        agents.sort_by_key(|a| a.seq);
        SnapshotData {
            status: StatusSnapshot {
                generated_at: Utc::now(),
                status: st.status(),
                metrics: st.metrics(self.started.elapsed()),
                objectives: st.sorted_objectives(),
                agents,
            },
            tasks: st.sorted_tasks(),
        }
    }
}

/// Owns the objective, task and agent tables and drives execution.
pub struct SwarmCoordinator {
    shared: Arc<Shared>,
    loop_rx: Mutex<Option<Receiver<LoopMessage>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    snapshots: Mutex<Option<SnapshotWriter>>,
    shut_down: AtomicBool,
}

impl SwarmCoordinator {
    pub fn new(config: SwarmConfig) -> Self {
        let coordination = Arc::new(CoordinationManager::new(config.coordination.clone()));
        let memory = Arc::new(MemoryStore::new(config.memory.clone()));
        let executor = Arc::new(
            TaskExecutor::new(config.executor.clone(), Arc::clone(&coordination))
                .with_memory(Arc::clone(&memory)),
        );
        let (loop_tx, loop_rx) = mpsc::channel();
        let policy = SchedulingPolicy::from(&config.coordinator);
        info!(
            selection = ?policy.selection,
            load_balancing = ?policy.load_balancing,
            tick_ms = config.coordinator.tick_interval_ms,
            "swarm coordinator created"
        );
        Self {
            shared: Arc::new(Shared {
                config,
                policy,
                state: RwLock::new(SwarmState::default()),
                events: EventBus::default(),
                handlers: HandlerRegistry::default(),
                executor,
                memory,
                coordination,
                workers: Mutex::new(HashMap::new()),
                loop_tx: Mutex::new(loop_tx),
                accepting: AtomicBool::new(true),
                started: Instant::now(),
            }),
            loop_rx: Mutex::new(Some(loop_rx)),
            loop_handle: Mutex::new(None),
            snapshots: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.shared.config
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.shared.memory
    }

    pub fn coordination(&self) -> &Arc<CoordinationManager> {
        &self.shared.coordination
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.shared.executor
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.shared.handlers
    }

    /// Route tasks of `task_type` to `handler`.
    pub fn register_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.shared.handlers.register(task_type, handler);
    }

    /// Handler for task types without a dedicated one.
    pub fn set_default_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.shared.handlers.set_default(handler);
    }

    fn ensure_accepting(&self) -> SwarmResult<()> {
        if self.shared.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwarmError::ShuttingDown)
        }
    }

    pub fn create_objective(
        &self,
        description: &str,
        strategy: &str,
        requirements: ObjectiveRequirements,
    ) -> SwarmResult<ObjectiveId> {
        self.ensure_accepting()?;
        let description = description.trim();
        if description.is_empty() {
            return Err(SwarmError::InvalidObjective(
                "description must not be empty".to_string(),
            ));
        }
        let threshold = requirements.quality_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(SwarmError::InvalidObjective(format!(
                "quality threshold {threshold} is outside [0, 1]"
            )));
        }
        let min_agents = requirements.min_agents.max(1);
        let max_agents = requirements.max_agents.unwrap_or(u32::MAX);
        if max_agents < min_agents {
            return Err(SwarmError::InvalidObjective(format!(
                "max_agents {max_agents} is below min_agents {min_agents}"
            )));
        }

        let strategy = Strategy::parse(strategy);
        let plan = decompose::decompose(description, &strategy, &requirements)?;
        let cfg = &self.shared.config.coordinator;
        let objective_id = new_id("objective");

        let task_count = plan.tasks.len();
        {
            let mut guard = write(&self.shared.state);
            let st = &mut *guard;
            let tasks = decompose::instantiate(&objective_id, &plan.tasks, &mut st.next_task_seq);
            let objective = Objective {
                id: objective_id.clone(),
                description: description.to_string(),
                strategy: strategy.clone(),
                required_agent_types: plan.agent_types,
                min_agents,
                max_agents,
                quality_threshold: threshold,
                max_duration_ms: requirements
                    .max_duration_ms
                    .unwrap_or(cfg.default_max_duration_ms),
                max_retries: requirements.max_retries.unwrap_or(cfg.max_retries),
                failure_policy: requirements.failure_policy.unwrap_or(cfg.failure_policy),
                status: ObjectiveStatus::Created,
                progress: 0.0,
                outcome: None,
                task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            };
            for task in tasks {
                st.tasks.insert(task.id.clone(), task);
            }
            st.objectives.insert(objective_id.clone(), objective);
            st.metrics.objectives_created += 1;
        }

        info!(
            objective = %objective_id,
            strategy = %strategy,
            tasks = task_count,
            "objective created"
        );
        self.shared.events.publish(SwarmEvent::ObjectiveAdded {
            ts_ms: now_ms(),
            objective_id: objective_id.clone(),
            strategy: strategy.to_string(),
            task_count,
        });
        Ok(objective_id)
    }

    pub fn register_agent(
        &self,
        name: &str,
        agent_type: &str,
        capabilities: AgentCapabilities,
    ) -> SwarmResult<AgentId> {
        self.ensure_accepting()?;
        let agent_id = new_id("agent");
        let tx = lock(&self.shared.loop_tx).clone();
        let worker = AgentWorker::spawn(agent_id.clone(), Arc::clone(&self.shared.executor), tx)
            .map_err(|err| SwarmError::task_failed(format!("{err:#}")))?;
        lock(&self.shared.workers).insert(agent_id.clone(), worker);

        {
            let mut st = write(&self.shared.state);
            let seq = st.next_agent_seq;
            st.next_agent_seq += 1;
            st.agents.push(Agent {
                id: agent_id.clone(),
                name: name.to_string(),
                agent_type: agent_type.trim().to_lowercase(),
                capabilities,
                status: AgentStatus::Idle,
                current_task: None,
                completed_task_ids: Vec::new(),
                error_count: 0,
                seq,
            });
        }
        info!(agent = %agent_id, name, agent_type, "agent registered");
        self.shared.wake();
        Ok(agent_id)
    }

    /// Start executing an objective. Returns once it is marked executing.
    pub fn execute(&self, objective_id: &str) -> SwarmResult<()> {
        self.ensure_accepting()?;
        {
            let mut guard = write(&self.shared.state);
            let st = &mut *guard;
            let objective = st
                .objectives
                .get(objective_id)
                .ok_or_else(|| SwarmError::NotFound(format!("objective '{objective_id}'")))?;
            if objective.outcome.is_some()
                || matches!(
                    objective.status,
                    ObjectiveStatus::Completed | ObjectiveStatus::Failed
                )
            {
                return Err(SwarmError::InvalidObjective(format!(
                    "objective '{objective_id}' has already finished"
                )));
            }
            if objective.status == ObjectiveStatus::Executing {
                return Err(SwarmError::InvalidObjective(format!(
                    "objective '{objective_id}' is already executing"
                )));
            }

            let tasks: Vec<&Task> = st.objective_tasks(objective_id).collect();
            let available = st
                .agents
                .iter()
                .filter(|a| tasks.iter().any(|t| a.can_take(t)))
                .count() as u32;
            if available < objective.min_agents {
                return Err(SwarmError::InsufficientAgents {
                    objective_id: objective_id.to_string(),
                    required: objective.min_agents,
                    available,
                });
            }

            let budget = Duration::from_millis(objective.max_duration_ms);
            st.deadlines
                .insert(objective_id.to_string(), Instant::now() + budget);
            if let Some(objective) = st.objectives.get_mut(objective_id) {
                objective.status = ObjectiveStatus::Executing;
                objective.started_at = Some(Utc::now());
            }
            // Published under the lock so it precedes every loop event.
            self.shared.events.publish(SwarmEvent::ObjectiveStarted {
                ts_ms: now_ms(),
                objective_id: objective_id.to_string(),
            });
        }

        self.start_loop()?;
        self.start_snapshots();
        info!(objective = %objective_id, "objective executing");
        self.shared.wake();
        Ok(())
    }

    fn start_loop(&self) -> SwarmResult<()> {
        let Some(rx) = lock(&self.loop_rx).take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("swarm-scheduler".to_string())
            .spawn(move || run_loop(shared, rx))
            .map_err(|err| SwarmError::task_failed(format!("spawn scheduling loop: {err}")))?;
        *lock(&self.loop_handle) = Some(handle);
        Ok(())
    }

    fn start_snapshots(&self) {
        let Some(run_dir) = self.shared.config.coordinator.run_dir.clone() else {
            return;
        };
        let mut slot = lock(&self.snapshots);
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        match SnapshotWriter::spawn(
            run_dir,
            self.shared.config.coordinator.status_interval(),
            move || shared.snapshot(),
        ) {
            Ok(writer) => *slot = Some(writer),
            Err(err) => warn!(error = %err, "snapshot writer not started"),
        }
    }

    pub fn get_status(&self) -> SwarmStatus {
        read(&self.shared.state).status()
    }

    /// All tasks in creation order.
    pub fn get_tasks(&self) -> Vec<Task> {
        read(&self.shared.state).sorted_tasks()
    }

    pub fn get_objective_tasks(&self, objective_id: &str) -> SwarmResult<Vec<Task>> {
        let st = read(&self.shared.state);
        if !st.objectives.contains_key(objective_id) {
            return Err(SwarmError::NotFound(format!("objective '{objective_id}'")));
        }
        let mut tasks: Vec<Task> = st.objective_tasks(objective_id).cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        Ok(tasks)
    }

    pub fn get_task(&self, task_id: &str) -> SwarmResult<Task> {
        read(&self.shared.state)
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SwarmError::NotFound(format!("task '{task_id}'")))
    }

    /// Registered agents in registration order.
    pub fn get_agents(&self) -> Vec<Agent> {
        let mut agents = read(&self.shared.state).agents.clone();
        agents.sort_by_key(|a| a.seq);
        agents
    }

    pub fn get_agent(&self, agent_id: &str) -> SwarmResult<Agent> {
        read(&self.shared.state)
            .agents
            .iter()
            .find(|a| a.id == agent_id)
            .cloned()
            .ok_or_else(|| SwarmError::NotFound(format!("agent '{agent_id}'")))
    }

    pub fn get_objectives(&self) -> Vec<Objective> {
        read(&self.shared.state).sorted_objectives()
    }

    pub fn get_objective(&self, objective_id: &str) -> SwarmResult<Objective> {
        read(&self.shared.state)
            .objectives
            .get(objective_id)
            .cloned()
            .ok_or_else(|| SwarmError::NotFound(format!("objective '{objective_id}'")))
    }

    pub fn get_metrics(&self) -> SwarmMetrics {
        read(&self.shared.state).metrics(self.shared.started.elapsed())
    }

    pub fn subscribe(&self) -> Receiver<SwarmEvent> {
        self.shared.events.subscribe()
    }

    pub fn recent_events(&self, n: usize) -> Vec<SwarmEvent> {
        self.shared.events.recent(n)
    }

    /// Poll until the objective settles. `Ok(None)` when `timeout` elapses first.
    pub fn wait_for_objective(
        &self,
        objective_id: &str,
        timeout: Duration,
    ) -> SwarmResult<Option<ObjectiveOutcome>> {
        let deadline = Instant::now() + timeout;
        loop {
            let outcome = self.get_objective(objective_id)?.outcome;
            if outcome.is_some() {
                return Ok(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL.min(deadline - now));
        }
    }

    /// Remove a settled (or never started) objective and its tasks. Stored
    /// results stay in memory under the objective namespace.
    pub fn cleanup_objective(&self, objective_id: &str) -> SwarmResult<()> {
        let mut guard = write(&self.shared.state);
        let st = &mut *guard;
        let objective = st
            .objectives
            .get(objective_id)
            .ok_or_else(|| SwarmError::NotFound(format!("objective '{objective_id}'")))?;
        let running = st
            .objective_tasks(objective_id)
            .any(|t| t.status == TaskStatus::Running);
        if (objective.status == ObjectiveStatus::Executing && objective.outcome.is_none())
            || running
        {
            return Err(SwarmError::InvalidObjective(format!(
                "objective '{objective_id}' is still executing"
            )));
        }
        if let Some(objective) = st.objectives.remove(objective_id) {
            for task_id in &objective.task_ids {
                st.tasks.remove(task_id);
            }
            debug!(
                objective = %objective_id,
                tasks = objective.task_ids.len(),
                "objective cleaned up"
            );
        }
        st.deadlines.remove(objective_id);
        st.timed_out.remove(objective_id);
        Ok(())
    }

    /// Stop accepting work, let in-flight attempts finish, then stop the loop,
    /// the agent workers, the snapshot writer (final snapshot) and the memory
    /// store. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("swarm coordinator shutting down");
        self.shared.accepting.store(false, Ordering::SeqCst);
        let _ = lock(&self.shared.loop_tx).send(LoopMessage::Shutdown);

        let mut failures = Vec::new();
        if let Some(handle) = lock(&self.loop_handle).take() {
            if handle.join().is_err() {
                failures.push("scheduling loop panicked".to_string());
            }
        }
        let workers: Vec<AgentWorker> = lock(&self.shared.workers)
            .drain()
            .map(|(_, w)| w)
            .collect();
        for mut worker in workers {
            if let Err(err) = worker.stop() {
                failures.push(format!("{err:#}"));
            }
        }
        if let Some(mut writer) = lock(&self.snapshots).take() {
            if let Err(err) = writer.stop() {
                failures.push(format!("{err:#}"));
            }
        }
        self.shared
            .memory
            .shutdown()
            .context("shut down memory store")?;

        if failures.is_empty() {
            info!("swarm coordinator stopped");
            Ok(())
        } else {
            Err(anyhow!("shutdown finished with errors: {}", failures.join("; ")))
        }
    }
}

impl Drop for SwarmCoordinator {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            self.shared.accepting.store(false, Ordering::SeqCst);
            let _ = lock(&self.shared.loop_tx).send(LoopMessage::Shutdown);
        }
    }
}

fn run_loop(shared: Arc<Shared>, rx: Receiver<LoopMessage>) {
    let tick = shared.config.coordinator.tick_interval();
    let mut stopping = false;
    debug!(tick_ms = tick.as_millis() as u64, "scheduling loop started");
    loop {
        let mut completions = Vec::new();
        let mut take = |msg: LoopMessage, stopping: &mut bool| match msg {
            LoopMessage::Finished(done) => completions.push(done),
            LoopMessage::Wake => {}
            LoopMessage::Shutdown => *stopping = true,
        };
        match rx.recv_timeout(tick) {
            Ok(msg) => take(msg, &mut stopping),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => stopping = true,
        }
        while let Ok(msg) = rx.try_recv() {
            take(msg, &mut stopping);
        }

        // Results reach memory before the state lock is taken so status
        // readers never wait on replica writes.
        let judged: Vec<(Completion, SwarmResult<()>)> = completions
            .into_iter()
            .map(|done| {
                let verdict = judge_completion(&shared, &done);
                (done, verdict)
            })
            .collect();
        let (events, running) = {
            let mut guard = write(&shared.state);
            let st = &mut *guard;
            let mut events = Vec::new();
            for (done, verdict) in judged {
                apply_completion(&shared, st, done, verdict, &mut events);
            }
            tick_once(&shared, st, !stopping, &mut events);
            (events, st.running_count())
        };
        for event in events {
            shared.events.publish(event);
        }
        if stopping && running == 0 {
            break;
        }
    }
    debug!("scheduling loop stopped");
}

fn tick_once(shared: &Shared, st: &mut SwarmState, dispatch_allowed: bool, events: &mut Vec<SwarmEvent>) {
    st.metrics.scheduler_ticks += 1;
    let now = Instant::now();

    let expired: Vec<ObjectiveId> = st
        .deadlines
        .iter()
        .filter(|(id, deadline)| now >= **deadline && !st.timed_out.contains(*id))
        .map(|(id, _)| id.clone())
        .collect();
    for id in expired {
        if st.objectives.get(&id).map(|o| o.outcome.is_none()).unwrap_or(false) {
            warn!(objective = %id, "objective exceeded its max duration; no new dispatches");
            st.timed_out.insert(id);
        }
    }

    let mut live: Vec<ObjectiveId> = st
        .objectives
        .keys()
        .filter(|id| st.is_dispatchable(id))
        .cloned()
        .collect();
    live.sort();

    for objective_id in &live {
        let ready = scheduler::ready_tasks(st.objective_tasks(objective_id), &st.tasks);
        for task_id in ready {
            if let Some(task) = st.tasks.get_mut(&task_id) {
                task.status = TaskStatus::Queued;
                debug!(task = %task_id, name = %task.name, "task ready");
            }
        }
    }

    {
        let SwarmState {
            agents, idle_ticks, ..
        } = &mut *st;
        for agent in agents.iter() {
            let ticks = idle_ticks.entry(agent.id.clone()).or_insert(0);
            if agent.status == AgentStatus::Idle && agent.current_task.is_none() {
                *ticks = ticks.saturating_add(1);
            } else {
                *ticks = 0;
            }
        }
    }

    if dispatch_allowed && !live.is_empty() {
        let mut cursor = st.rr_cursor;
        let plan = {
            let mut queued: Vec<&Task> = live
                .iter()
                .flat_map(|id| st.objective_tasks(id))
                .filter(|t| t.status == TaskStatus::Queued)
                .collect();
            scheduler::order_queued(&mut queued);
            let agents: Vec<&Agent> = st.agents.iter().collect();
            let mut slots: HashMap<ObjectiveId, ObjectiveSlots> = live
                .iter()
                .map(|id| {
                    let running = st
                        .objective_tasks(id)
                        .filter(|t| t.status == TaskStatus::Running)
                        .count();
                    let max_running = st
                        .objectives
                        .get(id)
                        .map(|o| o.max_agents as usize)
                        .unwrap_or(usize::MAX);
                    (id.clone(), ObjectiveSlots { running, max_running })
                })
                .collect();
            scheduler::plan_assignments(
                &queued,
                &agents,
                &mut slots,
                &st.idle_ticks,
                &shared.policy,
                &mut cursor,
            )
        };
        st.rr_cursor = cursor;
        for (task_id, agent_id) in plan.preferences {
            if let Some(task) = st.tasks.get_mut(&task_id) {
                task.assigned_agent = Some(agent_id);
            }
        }
        for assignment in plan.assignments {
            dispatch(shared, st, assignment, events);
        }
    }

    settle_objectives(st, events);
}

fn dispatch(shared: &Shared, st: &mut SwarmState, assignment: Assignment, events: &mut Vec<SwarmEvent>) {
    let Assignment {
        task_id,
        agent_id,
        stolen_from,
    } = assignment;
    let Some(task) = st.tasks.get_mut(&task_id) else {
        return;
    };
    task.status = TaskStatus::Running;
    task.assigned_agent = Some(agent_id.clone());
    task.started_at = Some(Utc::now());
    let job = task.clone();
    let attempt = job.retry_count + 1;

    let mut granted_tools = None;
    if let Some(agent) = st.agents.iter_mut().find(|a| a.id == agent_id) {
        granted_tools = Some(agent.capabilities.tools.clone());
        let from = agent.status;
        agent.status = AgentStatus::Busy;
        agent.current_task = Some(task_id.clone());
        if from != AgentStatus::Busy {
            events.push(SwarmEvent::AgentStatusChanged {
                ts_ms: now_ms(),
                agent_id: agent_id.clone(),
                from,
                to: AgentStatus::Busy,
            });
        }
    }
    st.idle_ticks.insert(agent_id.clone(), 0);
    st.metrics.tasks_dispatched += 1;

    if let Some(from_agent) = stolen_from {
        st.metrics.work_steals += 1;
        info!(task = %task_id, from = %from_agent, to = %agent_id, "work stolen");
        events.push(SwarmEvent::WorkStolen {
            ts_ms: now_ms(),
            task_id: task_id.clone(),
            from_agent,
            to_agent: agent_id.clone(),
        });
    }
    debug!(task = %task_id, name = %job.name, agent = %agent_id, attempt, "dispatching task");
    events.push(SwarmEvent::TaskStarted {
        ts_ms: now_ms(),
        objective_id: job.objective_id.clone(),
        task_id: task_id.clone(),
        agent_id: agent_id.clone(),
        attempt,
    });

    let handler = shared
        .handlers
        .resolve(&job.task_type)
        .unwrap_or_else(missing_handler);
    let timeout_ms = job
        .timeout_ms
        .unwrap_or(shared.config.coordinator.default_task_timeout_ms);
    let options = ExecutionOptions {
        timeout: Some(Duration::from_millis(timeout_ms)),
        tools: granted_tools.filter(|t| !t.is_empty()),
        ..ExecutionOptions::default()
    };
    let sent = lock(&shared.workers).get(&agent_id).map(|w| {
        w.dispatch(Dispatch {
            task: job,
            handler,
            options,
        })
    });
    if !matches!(sent, Some(Ok(()))) {
        warn!(task = %task_id, agent = %agent_id, "agent worker unavailable");
        fail_attempt(
            st,
            &task_id,
            &agent_id,
            SwarmError::task_failed(format!("worker for agent '{agent_id}' is unavailable")),
            shared.config.coordinator.agent_error_threshold,
            events,
        );
    }
}

/// Quality gate plus result write for a successful attempt. Runs without the
/// state write lock.
fn judge_completion(shared: &Shared, done: &Completion) -> SwarmResult<()> {
    let Ok(output) = &done.result else {
        return Ok(());
    };
    let found = {
        let st = read(&shared.state);
        st.tasks.get(&done.task_id).map(|t| {
            let threshold = st
                .objectives
                .get(&t.objective_id)
                .map(|o| o.quality_threshold)
                .unwrap_or(0.0);
            (t.objective_id.clone(), t.name.clone(), threshold)
        })
    };
    let Some((objective_id, name, quality_threshold)) = found else {
        return Ok(());
    };
    match output.quality {
        Some(score) if quality_threshold > 0.0 && score < quality_threshold => {
            Err(SwarmError::QualityBelowThreshold {
                score,
                threshold: quality_threshold,
            })
        }
        _ => shared
            .memory
            .put(
                &result_namespace(&objective_id),
                &result_key(&name),
                output.result.as_bytes().to_vec(),
                None,
            )
            .map(|_| ()),
    }
}

fn apply_completion(
    shared: &Shared,
    st: &mut SwarmState,
    done: Completion,
    verdict: SwarmResult<()>,
    events: &mut Vec<SwarmEvent>,
) {
    let Completion {
        agent_id,
        task_id,
        result,
    } = done;
    let threshold = shared.config.coordinator.agent_error_threshold;
    if !st.tasks.contains_key(&task_id) {
        warn!(task = %task_id, "completion for unknown task");
        release_agent(st, &agent_id, None, false, threshold, events);
        return;
    }

    match result {
        Ok(output) => {
            st.metrics.attempts_finished += 1;
            st.metrics.attempt_ms_total += output.elapsed_ms;
            match verdict {
                Ok(()) => complete_task(st, &task_id, &agent_id, output, threshold, events),
                Err(err) => fail_attempt(st, &task_id, &agent_id, err, threshold, events),
            }
        }
        Err(failure) => {
            st.metrics.attempts_finished += 1;
            st.metrics.attempt_ms_total += failure.elapsed_ms;
            fail_attempt(st, &task_id, &agent_id, failure.error, threshold, events);
        }
    }
}

fn release_agent(
    st: &mut SwarmState,
    agent_id: &str,
    completed: Option<&str>,
    failed: bool,
    error_threshold: u32,
    events: &mut Vec<SwarmEvent>,
) {
    let Some(agent) = st.agents.iter_mut().find(|a| a.id == agent_id) else {
        return;
    };
    agent.current_task = None;
    if let Some(task_id) = completed {
        agent.completed_task_ids.push(task_id.to_string());
    }
    if failed {
        agent.error_count += 1;
    }
    let from = agent.status;
    let to = if agent.error_count > error_threshold {
        AgentStatus::Error
    } else {
        AgentStatus::Idle
    };
    agent.status = to;
    if from != to {
        if to == AgentStatus::Error {
            warn!(agent = %agent_id, errors = agent.error_count, "agent marked error");
        }
        events.push(SwarmEvent::AgentStatusChanged {
            ts_ms: now_ms(),
            agent_id: agent_id.to_string(),
            from,
            to,
        });
    }
}

fn complete_task(
    st: &mut SwarmState,
    task_id: &str,
    agent_id: &str,
    output: ExecutionOutput,
    error_threshold: u32,
    events: &mut Vec<SwarmEvent>,
) {
    release_agent(st, agent_id, Some(task_id), false, error_threshold, events);
    let Some(task) = st.tasks.get_mut(task_id) else {
        return;
    };
    task.status = TaskStatus::Completed;
    task.result = Some(output.result);
    task.error = None;
    task.completed_at = Some(Utc::now());
    st.metrics.tasks_completed += 1;
    debug!(task = %task_id, agent = %agent_id, elapsed_ms = output.elapsed_ms, "task completed");
    events.push(SwarmEvent::TaskCompleted {
        ts_ms: now_ms(),
        objective_id: task.objective_id.clone(),
        task_id: task_id.to_string(),
        agent_id: agent_id.to_string(),
        elapsed_ms: output.elapsed_ms,
    });
}

fn fail_attempt(
    st: &mut SwarmState,
    task_id: &str,
    agent_id: &str,
    error: SwarmError,
    error_threshold: u32,
    events: &mut Vec<SwarmEvent>,
) {
    release_agent(st, agent_id, None, true, error_threshold, events);
    let Some(objective_id) = st.tasks.get(task_id).map(|t| t.objective_id.clone()) else {
        return;
    };
    let (max_retries, policy) = st
        .objectives
        .get(&objective_id)
        .map(|o| (o.max_retries, o.failure_policy))
        .unwrap_or((0, FailurePolicy::FailFast));
    let dispatchable = st.is_dispatchable(&objective_id);

    let Some(task) = st.tasks.get_mut(task_id) else {
        return;
    };
    if !task.failed_agents.iter().any(|a| a == agent_id) {
        task.failed_agents.push(agent_id.to_string());
    }
    task.error = Some(error.to_string());
    let will_retry = dispatchable && task.retry_count < max_retries;
    if will_retry {
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        task.started_at = None;
        st.metrics.tasks_retried += 1;
        warn!(
            task = %task_id,
            agent = %agent_id,
            retry = task.retry_count,
            max_retries,
            error = %error,
            "task attempt failed; retrying"
        );
    } else {
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        st.metrics.tasks_failed += 1;
        warn!(task = %task_id, agent = %agent_id, error = %error, "task failed permanently");
    }
    events.push(SwarmEvent::TaskError {
        ts_ms: now_ms(),
        objective_id: objective_id.clone(),
        task_id: task_id.to_string(),
        agent_id: agent_id.to_string(),
        error: error.to_string(),
        will_retry,
    });

    if !will_retry && dispatchable && policy == FailurePolicy::FailFast {
        halt_objective(st, &objective_id, events);
    }
}

/// Fail-fast: mark the objective failed and cancel everything not yet running.
fn halt_objective(st: &mut SwarmState, objective_id: &str, events: &mut Vec<SwarmEvent>) {
    let Some(objective) = st.objectives.get_mut(objective_id) else {
        return;
    };
    objective.status = ObjectiveStatus::Failed;
    let task_ids = objective.task_ids.clone();

    let mut doomed: HashSet<TaskId> = task_ids
        .iter()
        .filter(|id| {
            st.tasks
                .get(*id)
                .map(|t| t.status == TaskStatus::Failed)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    loop {
        let grown: Vec<TaskId> = task_ids
            .iter()
            .filter(|id| !doomed.contains(*id))
            .filter(|id| {
                st.tasks
                    .get(*id)
                    .map(|t| t.dependencies.iter().any(|d| doomed.contains(d)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if grown.is_empty() {
            break;
        }
        doomed.extend(grown);
    }

    for task_id in &task_ids {
        let Some(task) = st.tasks.get_mut(task_id) else {
            continue;
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Queued) {
            continue;
        }
        let reason = if doomed.contains(task_id) {
            "dependency failed"
        } else {
            "objective failed"
        };
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        task.error = Some(reason.to_string());
        st.metrics.tasks_cancelled += 1;
        events.push(SwarmEvent::TaskCancelled {
            ts_ms: now_ms(),
            objective_id: objective_id.to_string(),
            task_id: task_id.clone(),
            reason: reason.to_string(),
        });
    }
    warn!(objective = %objective_id, "objective failed; remaining tasks cancelled");
}

#[derive(Debug, Default)]
struct Tally {
    total: usize,
    queued: usize,
    running: usize,
    completed: usize,
    failed: usize,
}

fn settle_objectives(st: &mut SwarmState, events: &mut Vec<SwarmEvent>) {
    let started: Vec<ObjectiveId> = st
        .objectives
        .values()
        .filter(|o| o.outcome.is_none() && o.status != ObjectiveStatus::Created)
        .map(|o| o.id.clone())
        .collect();

    for objective_id in started {
        let mut tally = Tally::default();
        for task in st.objective_tasks(&objective_id) {
            tally.total += 1;
            match task.status {
                TaskStatus::Queued => tally.queued += 1,
                TaskStatus::Running => tally.running += 1,
                TaskStatus::Completed => tally.completed += 1,
                TaskStatus::Failed => tally.failed += 1,
                TaskStatus::Pending | TaskStatus::Cancelled => {}
            }
        }
        let timed_out = st.timed_out.contains(&objective_id);
        let Some(objective) = st.objectives.get_mut(&objective_id) else {
            continue;
        };
        objective.progress = if tally.total == 0 {
            1.0
        } else {
            tally.completed as f64 / tally.total as f64
        };

        let outcome = if objective.status == ObjectiveStatus::Failed {
            (tally.running == 0).then_some(ObjectiveOutcome::Failed)
        } else if tally.completed == tally.total {
            objective.status = ObjectiveStatus::Completed;
            Some(ObjectiveOutcome::Completed)
        } else if timed_out {
            (tally.running == 0).then_some(ObjectiveOutcome::TimedOut)
        } else if tally.running == 0 && tally.queued == 0 && tally.failed > 0 {
            // Every pending task left sits behind a failed dependency.
            Some(ObjectiveOutcome::PartiallyCompleted)
        } else {
            None
        };

        let Some(outcome) = outcome else {
            continue;
        };
        objective.outcome = Some(outcome);
        objective.finished_at = Some(Utc::now());
        let progress = objective.progress;
        if outcome == ObjectiveOutcome::Completed {
            st.metrics.objectives_completed += 1;
        } else {
            st.metrics.objectives_failed += 1;
        }
        st.deadlines.remove(&objective_id);
        info!(
            objective = %objective_id,
            outcome = ?outcome,
            progress,
            completed = tally.completed,
            failed = tally.failed,
            "objective finished"
        );
        events.push(SwarmEvent::ObjectiveFinished {
            ts_ms: now_ms(),
            objective_id,
            outcome,
            progress,
        });
    }
}
