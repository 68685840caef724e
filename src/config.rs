use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level engine configuration.
///
/// Every field has a default, so an empty YAML document is a valid config.
/// Durations are expressed in milliseconds to keep the file format plain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwarmConfig {
    pub coordinator: CoordinatorConfig,
    pub executor: ExecutorConfig,
    pub memory: MemoryConfig,
    pub coordination: CoordinationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel dependents of a permanently failed task and fail the objective.
    #[default]
    FailFast,
    /// Leave dependents pending-blocked and keep running independent work.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Highest `capabilities.priority` first, then lowest load, then registration order.
    #[default]
    Capability,
    /// Fewest completed tasks first.
    LeastLoaded,
    /// Rotate through eligible agents.
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Queued tasks wait for the agent they were assigned to.
    Static,
    /// Idle agents with an empty queue pull work preferred for a busy peer.
    #[default]
    WorkStealing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    #[default]
    Eventual,
    Strong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub tick_interval_ms: u64,
    pub max_retries: u32,
    pub failure_policy: FailurePolicy,
    pub selection: SelectionStrategy,
    pub load_balancing: LoadBalancing,
    /// An idle agent steals only after this many consecutive idle ticks.
    pub steal_after_idle_ticks: u32,
    /// Agents whose error count exceeds this are marked `error`.
    pub agent_error_threshold: u32,
    pub default_task_timeout_ms: u64,
    pub default_max_duration_ms: u64,
    pub status_interval_ms: u64,
    /// Directory for status snapshots; no snapshots are written when unset.
    pub run_dir: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            max_retries: 3,
            failure_policy: FailurePolicy::FailFast,
            selection: SelectionStrategy::Capability,
            load_balancing: LoadBalancing::WorkStealing,
            steal_after_idle_ticks: 2,
            agent_error_threshold: 5,
            default_task_timeout_ms: 300_000,
            default_max_duration_ms: 3_600_000,
            status_interval_ms: 1_000,
            run_dir: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

/// Hard ceilings applied to a single task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    pub max_cpu_time_ms: u64,
    pub max_disk_bytes: u64,
    pub max_network_connections: u64,
    pub max_file_handles: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024,
            max_cpu_time_ms: 600_000,
            max_disk_bytes: 1024 * 1024 * 1024,
            max_network_connections: 16,
            max_file_handles: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub limits: ResourceLimits,
    /// Grace period between the stop signal and forced termination.
    pub kill_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub stream_output: bool,
    /// Tools a task may request through its execution context.
    pub allowed_tools: Vec<String>,
    /// Programs command tasks may launch.
    pub allowed_commands: Vec<String>,
    /// Environment variables passed through to command tasks.
    pub allowed_env: Vec<String>,
    /// Working directory for command tasks (defaults to the system temp dir).
    pub sandbox_dir: Option<PathBuf>,
    /// Timeout for acquiring a task's declared resources.
    pub lock_wait_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            kill_timeout_ms: 5_000,
            poll_interval_ms: 10,
            stream_output: false,
            allowed_tools: Vec::new(),
            allowed_commands: Vec::new(),
            allowed_env: vec!["PATH".to_string()],
            sandbox_dir: None,
            lock_wait_ms: 1_000,
        }
    }
}

impl ExecutorConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub consistency: Consistency,
    /// Total number of replicas, the local one included.
    pub replication_factor: usize,
    pub cache_size: usize,
    pub cache_ttl_ms: u64,
    pub backup_interval_ms: u64,
    pub max_backups: usize,
    /// Backups are disabled when unset.
    pub backup_dir: Option<PathBuf>,
    pub sweep_interval_ms: u64,
    /// Artificial propagation delay applied to asynchronous replication.
    pub replication_delay_ms: u64,
    pub replication_retry_ms: u64,
    pub flush_timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            consistency: Consistency::Eventual,
            replication_factor: 3,
            cache_size: 1_000,
            cache_ttl_ms: 60_000,
            backup_interval_ms: 3_600_000,
            max_backups: 5,
            backup_dir: None,
            sweep_interval_ms: 60_000,
            replication_delay_ms: 0,
            replication_retry_ms: 50,
            flush_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationConfig {
    pub deadlock_detection: bool,
    /// Lease of a granted lock; an expired lease frees the resource.
    pub resource_timeout_ms: u64,
    pub message_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            deadlock_detection: true,
            resource_timeout_ms: 60_000,
            message_timeout_ms: 30_000,
        }
    }
}

impl SwarmConfig {
    /// Load a YAML config file, apply environment overrides and validate.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read swarm config: {}", path.display()))?;
        let mut cfg: SwarmConfig = if text.trim().is_empty() {
            SwarmConfig::default()
        } else {
            serde_yaml::from_str(&text)
                .with_context(|| format!("parse swarm config yaml: {}", path.display()))?
        };
        cfg.apply_env_overrides()?;
        cfg.validate()
            .with_context(|| format!("validate swarm config: {}", path.display()))?;
        info!(path = %path.display(), "loaded swarm config");
        Ok(cfg)
    }

    /// Overrides from `SWARM_RUN_DIR`, `SWARM_MAX_RETRIES`, `SWARM_CONSISTENCY`
    /// and `SWARM_TICK_MS`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dir) = env::var_os("SWARM_RUN_DIR") {
            self.coordinator.run_dir = Some(PathBuf::from(dir));
        }
        if let Ok(raw) = env::var("SWARM_MAX_RETRIES") {
            self.coordinator.max_retries = raw.trim().parse().map_err(|_| {
                anyhow!("invalid SWARM_MAX_RETRIES: '{raw}' (must be a non-negative integer)")
            })?;
        }
        if let Ok(raw) = env::var("SWARM_CONSISTENCY") {
            self.memory.consistency = match raw.trim().to_lowercase().as_str() {
                "eventual" => Consistency::Eventual,
                "strong" => Consistency::Strong,
                _ => {
                    return Err(anyhow!(
                        "invalid SWARM_CONSISTENCY: '{raw}' (expected eventual or strong)"
                    ))
                }
            };
        }
        if let Ok(raw) = env::var("SWARM_TICK_MS") {
            let parsed: u64 = raw.trim().parse().map_err(|_| {
                anyhow!("invalid SWARM_TICK_MS: '{raw}' (must be a positive integer)")
            })?;
            if parsed == 0 {
                return Err(anyhow!(
                    "invalid SWARM_TICK_MS: '{raw}' (must be a positive integer)"
                ));
            }
            self.coordinator.tick_interval_ms = parsed;
        }
        debug!(run_dir = ?self.coordinator.run_dir, "applied env overrides");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.coordinator.tick_interval_ms == 0 {
            return Err(anyhow!("coordinator.tick_interval_ms must be >= 1"));
        }
        if self.coordinator.status_interval_ms == 0 {
            return Err(anyhow!("coordinator.status_interval_ms must be >= 1"));
        }
        if self.coordinator.steal_after_idle_ticks == 0 {
            return Err(anyhow!("coordinator.steal_after_idle_ticks must be >= 1"));
        }
        if self.memory.replication_factor == 0 {
            return Err(anyhow!("memory.replication_factor must be >= 1"));
        }
        if self.memory.cache_size == 0 {
            return Err(anyhow!("memory.cache_size must be >= 1"));
        }
        if self.memory.backup_dir.is_some() && self.memory.max_backups == 0 {
            return Err(anyhow!(
                "memory.max_backups must be >= 1 when memory.backup_dir is set"
            ));
        }
        if self.memory.backup_interval_ms == 0 || self.memory.sweep_interval_ms == 0 {
            return Err(anyhow!(
                "memory.backup_interval_ms and memory.sweep_interval_ms must be >= 1"
            ));
        }
        Ok(())
    }
}
