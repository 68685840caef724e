//! Runs one task attempt under resource ceilings and a timeout.
//!
//! The unit of work is a [`TaskHandler`]; it runs on its own thread and talks
//! to the runtime only through its [`ExecutionContext`]. The executor polls
//! for completion, enforces limits, and escalates a timeout from a graceful
//! stop request to forced termination.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capability::CapabilitySet;
use crate::command::CommandSandbox;
use crate::config::{ExecutorConfig, ResourceLimits};
use crate::coordination::{CoordinationManager, LockToken};
use crate::error::{SwarmError, SwarmResult};
use crate::memory::MemoryStore;
use crate::model::Task;
use crate::sync::lock;

/// A unit of work. Implementations should check
/// [`ExecutionContext::should_stop`] between steps.
pub trait TaskHandler: Send + Sync {
    fn run(&self, task: &Task, ctx: &ExecutionContext) -> SwarmResult<String>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task, &ExecutionContext) -> SwarmResult<String> + Send + Sync,
{
    fn run(&self, task: &Task, ctx: &ExecutionContext) -> SwarmResult<String> {
        self(task, ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Disk,
    NetworkConnections,
    FileHandles,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Memory => "memory_bytes",
            ResourceKind::Disk => "disk_bytes",
            ResourceKind::NetworkConnections => "network_connections",
            ResourceKind::FileHandles => "file_handles",
        }
    }

    fn limit(self, limits: &ResourceLimits) -> u64 {
        match self {
            ResourceKind::Memory => limits.max_memory_bytes,
            ResourceKind::Disk => limits.max_disk_bytes,
            ResourceKind::NetworkConnections => limits.max_network_connections,
            ResourceKind::FileHandles => limits.max_file_handles,
        }
    }
}

/// Current charges against a context's ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_connections: u64,
    pub file_handles: u64,
    pub cpu_time_ms: u64,
}

impl ResourceUsage {
    fn slot(&mut self, kind: ResourceKind) -> &mut u64 {
        match kind {
            ResourceKind::Memory => &mut self.memory_bytes,
            ResourceKind::Disk => &mut self.disk_bytes,
            ResourceKind::NetworkConnections => &mut self.network_connections,
            ResourceKind::FileHandles => &mut self.file_handles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub task_id: String,
    pub seq: u64,
    pub data: String,
}

struct ContextInner {
    task_id: String,
    limits: ResourceLimits,
    started: Instant,
    stop: AtomicBool,
    terminated: AtomicBool,
    usage: Mutex<ResourceUsage>,
    violation: Mutex<Option<SwarmError>>,
    output: Mutex<String>,
    chunk_seq: AtomicU64,
    stream: Option<Mutex<Sender<OutputChunk>>>,
    allowed_tools: CapabilitySet,
    sandbox: CommandSandbox,
    coordination: Arc<CoordinationManager>,
    lock_wait: Duration,
    locks: Mutex<Vec<LockToken>>,
    memory: Option<Arc<MemoryStore>>,
    namespace: String,
    quality: Mutex<Option<f64>>,
}

/// Handle a running unit uses to report output, charge resources and reach
/// shared services. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.inner.limits
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// True once a graceful stop was requested or the context was revoked.
    pub fn should_stop(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst) || self.is_terminated()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> SwarmResult<()> {
        if self.is_terminated() {
            return Err(SwarmError::task_failed(format!(
                "execution context for task '{}' was revoked",
                self.inner.task_id
            )));
        }
        Ok(())
    }

    /// Append to the output buffer (charged as memory) and forward the chunk
    /// when streaming is on.
    pub fn emit(&self, data: &str) -> SwarmResult<()> {
        self.ensure_live()?;
        self.allocate(ResourceKind::Memory, data.len() as u64)?;
        lock(&self.inner.output).push_str(data);
        if let Some(stream) = &self.inner.stream {
            let chunk = OutputChunk {
                task_id: self.inner.task_id.clone(),
                seq: self.inner.chunk_seq.fetch_add(1, Ordering::SeqCst),
                data: data.to_string(),
            };
            // A gone listener does not fail the task.
            let _ = lock(stream).send(chunk);
        }
        Ok(())
    }

    /// Charge `amount` against a ceiling. Crossing it records a violation
    /// that aborts the run.
    pub fn allocate(&self, kind: ResourceKind, amount: u64) -> SwarmResult<()> {
        self.ensure_live()?;
        let limit = kind.limit(&self.inner.limits);
        let used = {
            let mut usage = lock(&self.inner.usage);
            let slot = usage.slot(kind);
            *slot = slot.saturating_add(amount);
            *slot
        };
        if used > limit {
            let err = SwarmError::ResourceLimitExceeded {
                resource: kind.as_str().to_string(),
                used,
                limit,
            };
            self.record_violation(err.clone());
            return Err(err);
        }
        Ok(())
    }

    pub fn release(&self, kind: ResourceKind, amount: u64) {
        let mut usage = lock(&self.inner.usage);
        let slot = usage.slot(kind);
        *slot = slot.saturating_sub(amount);
    }

    pub fn usage(&self) -> ResourceUsage {
        let mut usage = *lock(&self.inner.usage);
        usage.cpu_time_ms = self.elapsed().as_millis() as u64;
        usage
    }

    pub fn check_tool(&self, tool: &str) -> SwarmResult<()> {
        if self.inner.allowed_tools.contains(tool) {
            Ok(())
        } else {
            Err(SwarmError::SandboxViolation(format!(
                "tool '{tool}' is not in the allow-list"
            )))
        }
    }

    pub fn sandbox(&self) -> &CommandSandbox {
        &self.inner.sandbox
    }

    /// Lock a resource for this task; released when the attempt ends.
    pub fn acquire_lock(&self, resource_id: &str) -> SwarmResult<LockToken> {
        self.ensure_live()?;
        let token = self.inner.coordination.acquire_lock(
            resource_id,
            &self.inner.task_id,
            self.inner.lock_wait,
        )?;
        lock(&self.inner.locks).push(token.clone());
        Ok(token)
    }

    pub fn memory_namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn memory_put(&self, key: &str, value: impl Into<Vec<u8>>) -> SwarmResult<u64> {
        self.ensure_live()?;
        let memory = self.memory()?;
        memory.put(&self.inner.namespace, key, value, None)
    }

    pub fn memory_get(&self, key: &str) -> SwarmResult<Vec<u8>> {
        let memory = self.memory()?;
        memory.get(&self.inner.namespace, key)
    }

    fn memory(&self) -> SwarmResult<&Arc<MemoryStore>> {
        self.inner
            .memory
            .as_ref()
            .ok_or_else(|| SwarmError::NotFound("memory store is not attached".to_string()))
    }

    /// Report output quality in `[0, 1]`.
    pub fn set_quality(&self, score: f64) {
        *lock(&self.inner.quality) = Some(score.clamp(0.0, 1.0));
    }

    pub fn output(&self) -> String {
        lock(&self.inner.output).clone()
    }

    fn quality(&self) -> Option<f64> {
        *lock(&self.inner.quality)
    }

    fn record_violation(&self, err: SwarmError) {
        let mut slot = lock(&self.inner.violation);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn violation(&self) -> Option<SwarmError> {
        lock(&self.inner.violation).clone()
    }

    fn stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.terminated.store(true, Ordering::SeqCst);
    }

    fn take_locks(&self) -> Vec<LockToken> {
        std::mem::take(&mut *lock(&self.inner.locks))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    Success,
    Error,
    GracefulStop,
    Forced,
    LimitExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub task_id: String,
    /// Value returned by the handler.
    pub result: String,
    /// Everything the handler emitted.
    pub output: String,
    pub exit: ExitKind,
    pub elapsed_ms: u64,
    pub quality: Option<f64>,
    pub usage: ResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("task '{task_id}' failed: {error}")]
pub struct ExecutionFailure {
    pub task_id: String,
    pub error: SwarmError,
    pub partial_output: String,
    pub exit: ExitKind,
    pub elapsed_ms: u64,
}

/// Per-call knobs; `None` falls back to the executor config.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub timeout: Option<Duration>,
    pub limits: Option<ResourceLimits>,
    /// Receives output chunks when `stream_output` is enabled.
    pub stream: Option<Sender<OutputChunk>>,
    /// Tools granted to this attempt on top of `allowed_tools`.
    pub tools: Option<CapabilitySet>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub tasks_run: u64,
    pub tasks_failed: u64,
    pub avg_duration_ms: f64,
    pub timeouts: u64,
    pub resource_violations: u64,
}

#[derive(Debug, Default)]
struct MetricsAcc {
    tasks_run: u64,
    tasks_failed: u64,
    total_duration_ms: u64,
    timeouts: u64,
    resource_violations: u64,
}

enum Watch {
    Finished(SwarmResult<String>),
    Violation(SwarmError),
    Forced,
}

pub struct TaskExecutor {
    config: ExecutorConfig,
    coordination: Arc<CoordinationManager>,
    memory: Option<Arc<MemoryStore>>,
    metrics: Mutex<MetricsAcc>,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig, coordination: Arc<CoordinationManager>) -> Self {
        Self {
            config,
            coordination,
            memory: None,
            metrics: Mutex::new(MetricsAcc::default()),
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn context(&self, task: &Task, options: &ExecutionOptions) -> ExecutionContext {
        let stream = if self.config.stream_output {
            options.stream.clone().map(Mutex::new)
        } else {
            None
        };
        let configured_tools: CapabilitySet = self.config.allowed_tools.iter().collect();
        ExecutionContext {
            inner: Arc::new(ContextInner {
                task_id: task.id.clone(),
                limits: options.limits.unwrap_or(self.config.limits),
                started: Instant::now(),
                stop: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                usage: Mutex::new(ResourceUsage::default()),
                violation: Mutex::new(None),
                output: Mutex::new(String::new()),
                chunk_seq: AtomicU64::new(0),
                stream,
                allowed_tools: match &options.tools {
                    Some(granted) => configured_tools.union(granted),
                    None => configured_tools,
                },
                sandbox: CommandSandbox::from_config(&self.config),
                coordination: Arc::clone(&self.coordination),
                lock_wait: Duration::from_millis(self.config.lock_wait_ms),
                locks: Mutex::new(Vec::new()),
                memory: self.memory.clone(),
                namespace: format!("objective/{}", task.objective_id),
                quality: Mutex::new(None),
            }),
        }
    }

    /// Run one attempt of `task`. Never retries.
    pub fn run(
        &self,
        task: &Task,
        handler: Arc<dyn TaskHandler>,
        options: ExecutionOptions,
    ) -> Result<ExecutionOutput, ExecutionFailure> {
        let ctx = self.context(task, &options);
        let timeout = options
            .timeout
            .or_else(|| task.timeout_ms.map(Duration::from_millis))
            .unwrap_or(Duration::from_millis(self.config.limits.max_cpu_time_ms));
        let start = Instant::now();
        let fail = |error: SwarmError, exit: ExitKind| ExecutionFailure {
            task_id: task.id.clone(),
            error,
            partial_output: ctx.output(),
            exit,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        let mut held = Vec::with_capacity(task.resources.len());
        for resource in &task.resources {
            match self.coordination.acquire_lock(
                resource,
                &task.id,
                Duration::from_millis(self.config.lock_wait_ms),
            ) {
                Ok(token) => held.push(token),
                Err(err) => {
                    for token in &held {
                        self.coordination.release_lock(token);
                    }
                    warn!(task = %task.id, resource = %resource, error = %err, "could not lock task resource");
                    let failure = fail(err, ExitKind::Error);
                    self.record(&failure.error, failure.elapsed_ms);
                    return Err(failure);
                }
            }
        }

        debug!(task = %task.id, timeout_ms = timeout.as_millis() as u64, "executing task");
        let watch = self.supervise(task, handler, &ctx, timeout);

        for token in held.iter().chain(ctx.take_locks().iter()) {
            self.coordination.release_lock(token);
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let result = match (watch, ctx.violation()) {
            (Watch::Violation(err), _) | (Watch::Finished(_), Some(err)) => {
                Err(fail(err, ExitKind::LimitExceeded))
            }
            (Watch::Forced, _) => Err(fail(
                SwarmError::TimedOutForced {
                    task_id: task.id.clone(),
                    elapsed_ms,
                },
                ExitKind::Forced,
            )),
            (Watch::Finished(_), None) if ctx.stop_requested() => Err(fail(
                SwarmError::TimedOutGraceful {
                    task_id: task.id.clone(),
                    elapsed_ms,
                },
                ExitKind::GracefulStop,
            )),
            (Watch::Finished(Ok(result)), None) => Ok(ExecutionOutput {
                task_id: task.id.clone(),
                result,
                output: ctx.output(),
                exit: ExitKind::Success,
                elapsed_ms,
                quality: ctx.quality(),
                usage: ctx.usage(),
            }),
            (Watch::Finished(Err(err)), None) => Err(fail(err, ExitKind::Error)),
        };

        match &result {
            Ok(out) => {
                self.record_success(out.elapsed_ms);
                debug!(task = %task.id, elapsed_ms, "task attempt succeeded");
            }
            Err(failure) => {
                self.record(&failure.error, failure.elapsed_ms);
                warn!(task = %task.id, code = failure.error.code(), error = %failure.error, "task attempt failed");
            }
        }
        result
    }

    fn supervise(
        &self,
        task: &Task,
        handler: Arc<dyn TaskHandler>,
        ctx: &ExecutionContext,
        timeout: Duration,
    ) -> Watch {
        let (tx, rx) = mpsc::channel();
        let worker_task = task.clone();
        let worker_ctx = ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("exec-{}", task.id))
            .spawn(move || {
                let out = handler.run(&worker_task, &worker_ctx);
                let _ = tx.send(out);
            });
        if let Err(err) = spawned {
            return Watch::Finished(Err(SwarmError::task_failed(format!(
                "failed to spawn execution thread: {err}"
            ))));
        }

        let poll = self.config.poll_interval();
        let kill_timeout = self.config.kill_timeout();
        let cpu_limit = Duration::from_millis(ctx.limits().max_cpu_time_ms);
        let started = Instant::now();
        let mut stop_requested_at: Option<Instant> = None;

        loop {
            match rx.recv_timeout(poll) {
                Ok(out) => return Watch::Finished(out),
                Err(RecvTimeoutError::Disconnected) => {
                    return Watch::Finished(Err(SwarmError::task_failed("task handler panicked")))
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if let Some(err) = ctx.violation() {
                ctx.terminate();
                return Watch::Violation(err);
            }
            let elapsed = started.elapsed();
            if elapsed >= cpu_limit {
                let err = SwarmError::ResourceLimitExceeded {
                    resource: "cpu_time_ms".to_string(),
                    used: elapsed.as_millis() as u64,
                    limit: cpu_limit.as_millis() as u64,
                };
                ctx.record_violation(err.clone());
                ctx.terminate();
                return Watch::Violation(err);
            }
            match stop_requested_at {
                None if elapsed >= timeout => {
                    info!(task = %task.id, elapsed_ms = elapsed.as_millis() as u64, "task timed out; requesting graceful stop");
                    ctx.request_stop();
                    stop_requested_at = Some(Instant::now());
                }
                Some(at) if at.elapsed() >= kill_timeout => {
                    warn!(task = %task.id, "task ignored stop request; forcing termination");
                    ctx.terminate();
                    return Watch::Forced;
                }
                _ => {}
            }
        }
    }

    fn record_success(&self, elapsed_ms: u64) {
        let mut m = lock(&self.metrics);
        m.tasks_run += 1;
        m.total_duration_ms += elapsed_ms;
    }

    fn record(&self, error: &SwarmError, elapsed_ms: u64) {
        let mut m = lock(&self.metrics);
        m.tasks_run += 1;
        m.tasks_failed += 1;
        m.total_duration_ms += elapsed_ms;
        if error.is_timeout() {
            m.timeouts += 1;
        }
        if matches!(error, SwarmError::ResourceLimitExceeded { .. }) {
            m.resource_violations += 1;
        }
    }

    pub fn get_execution_metrics(&self) -> ExecutionMetrics {
        let m = lock(&self.metrics);
        ExecutionMetrics {
            tasks_run: m.tasks_run,
            tasks_failed: m.tasks_failed,
            avg_duration_ms: if m.tasks_run == 0 {
                0.0
            } else {
                m.total_duration_ms as f64 / m.tasks_run as f64
            },
            timeouts: m.timeouts,
            resource_violations: m.resource_violations,
        }
    }
}
