use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;

use crate::capability::CapabilitySet;
use crate::config::FailurePolicy;

pub type ObjectiveId = String;
pub type TaskId = String;
pub type AgentId = String;

/// Random, prefix-tagged identifier (`task-3f9a01c2d4e5`).
pub fn new_id(prefix: &str) -> String {
    let n: u64 = rand::random();
    format!("{prefix}-{:012x}", n & 0xffff_ffff_ffff)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Auto,
    Research,
    Development,
    Analysis,
    Testing,
    Optimization,
    Maintenance,
    /// Unrecognized strategy name; only valid with explicit agent types.
    Custom(String),
}

impl Strategy {
    pub fn parse(raw: &str) -> Strategy {
        match raw.trim().to_lowercase().as_str() {
            "" | "auto" => Strategy::Auto,
            "research" => Strategy::Research,
            "development" => Strategy::Development,
            "analysis" => Strategy::Analysis,
            "testing" => Strategy::Testing,
            "optimization" => Strategy::Optimization,
            "maintenance" => Strategy::Maintenance,
            other => Strategy::Custom(other.to_string()),
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Strategy::Custom(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Strategy::Auto => "auto",
            Strategy::Research => "research",
            Strategy::Development => "development",
            Strategy::Analysis => "analysis",
            Strategy::Testing => "testing",
            Strategy::Optimization => "optimization",
            Strategy::Maintenance => "maintenance",
            Strategy::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveStatus {
    Created,
    Executing,
    Completed,
    Failed,
}

/// How the scheduling loop finished with an objective. `PartiallyCompleted`
/// and `TimedOut` leave `status` as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveOutcome {
    Completed,
    Failed,
    PartiallyCompleted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Running
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
}

/// A task as declared by the caller (explicit decomposition).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub name: String,
    pub task_type: String,
    pub description: String,
    pub priority: i32,
    /// Names of other tasks in the same objective.
    pub depends_on: Vec<String>,
    pub required_skills: CapabilitySet,
    pub input: JsonValue,
    /// Resources the task needs exclusively while running.
    pub resources: Vec<String>,
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            ..Self::default()
        }
    }

    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn skill(mut self, skill: impl AsRef<str>) -> Self {
        self.required_skills.insert(skill);
        self
    }

    pub fn input(mut self, input: JsonValue) -> Self {
        self.input = input;
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Submission-time knobs for an objective. `None` fields fall back to the
/// coordinator config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveRequirements {
    pub agent_types: Vec<String>,
    pub min_agents: u32,
    pub max_agents: Option<u32>,
    pub quality_threshold: f64,
    pub max_duration_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub failure_policy: Option<FailurePolicy>,
    /// Explicit task graph; when empty the strategy template is used.
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub id: ObjectiveId,
    pub description: String,
    pub strategy: Strategy,
    pub required_agent_types: Vec<String>,
    pub min_agents: u32,
    pub max_agents: u32,
    pub quality_threshold: f64,
    pub max_duration_ms: u64,
    pub max_retries: u32,
    pub failure_policy: FailurePolicy,
    pub status: ObjectiveStatus,
    pub progress: f64,
    pub outcome: Option<ObjectiveOutcome>,
    pub task_ids: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub objective_id: ObjectiveId,
    pub name: String,
    pub task_type: String,
    pub description: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub dependencies: BTreeSet<TaskId>,
    pub required_skills: CapabilitySet,
    pub resources: Vec<String>,
    pub assigned_agent: Option<AgentId>,
    pub input: JsonValue,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub timeout_ms: Option<u64>,
    /// Agents whose attempts at this task failed, oldest first.
    pub failed_agents: Vec<AgentId>,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCapabilities {
    pub skills: CapabilitySet,
    pub tools: CapabilitySet,
    pub max_concurrency: u32,
    pub priority: i32,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            skills: CapabilitySet::new(),
            tools: CapabilitySet::new(),
            max_concurrency: 1,
            priority: 0,
        }
    }
}

impl AgentCapabilities {
    pub fn with_skills<I, S>(skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            skills: skills.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn tool(mut self, tool: impl AsRef<str>) -> Self {
        self.tools.insert(tool);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub agent_type: String,
    pub capabilities: AgentCapabilities,
    pub status: AgentStatus,
    pub current_task: Option<TaskId>,
    pub completed_task_ids: Vec<TaskId>,
    pub error_count: u32,
    pub seq: u64,
}

impl Agent {
    /// Skills used for matching: declared skills plus the agent type itself.
    pub fn skill_set(&self) -> CapabilitySet {
        self.capabilities.skills.clone().with(&self.agent_type)
    }

    /// Eligible for `task`: not in error, has capacity, and covers its skills.
    pub fn can_take(&self, task: &Task) -> bool {
        self.status != AgentStatus::Error
            && self.capabilities.max_concurrency > 0
            && self.skill_set().satisfies(&task.required_skills)
    }
}

/// Point-in-time counters returned by `get_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub active_tasks: usize,
    pub active_agents: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub pending_tasks: usize,
    pub queued_tasks: usize,
    pub cancelled_tasks: usize,
    pub total_agents: usize,
}

/// Coordinator counters returned by `get_metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmMetrics {
    pub objectives_created: u64,
    pub objectives_completed: u64,
    pub objectives_failed: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_cancelled: u64,
    pub work_steals: u64,
    pub scheduler_ticks: u64,
    pub avg_task_duration_ms: f64,
    pub uptime_ms: u64,
}
