use thiserror::Error;

/// Domain errors surfaced by the coordinator, executor, memory store and
/// coordination manager.
///
/// Task-level variants (`ResourceLimitExceeded`, both timeouts, lock errors) are
/// recovered by the coordinator's retry logic and end up as task error strings;
/// they never cross the objective-execution boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SwarmError {
    #[error("invalid strategy '{strategy}': no agent types required and strategy is not recognized")]
    InvalidStrategy { strategy: String },

    #[error("invalid objective: {0}")]
    InvalidObjective(String),

    #[error("objective '{objective_id}' needs at least {required} eligible agent(s), found {available}")]
    InsufficientAgents {
        objective_id: String,
        required: u32,
        available: u32,
    },

    #[error("resource limit exceeded: {resource} used {used} > limit {limit}")]
    ResourceLimitExceeded {
        resource: String,
        used: u64,
        limit: u64,
    },

    #[error("task '{task_id}' timed out after {elapsed_ms}ms and stopped gracefully")]
    TimedOutGraceful { task_id: String, elapsed_ms: u64 },

    #[error("task '{task_id}' timed out after {elapsed_ms}ms and was force-terminated")]
    TimedOutForced { task_id: String, elapsed_ms: u64 },

    #[error("resource '{resource_id}' is busy (held by '{holder}')")]
    Busy { resource_id: String, holder: String },

    #[error("granting '{resource_id}' to '{requester}' would deadlock (wait-for cycle through '{holder}')")]
    WouldDeadlock {
        resource_id: String,
        requester: String,
        holder: String,
    },

    #[error("message '{message_id}' was not acknowledged within {timeout_ms}ms")]
    MessageTimeout { message_id: String, timeout_ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quorum unavailable: {acks} of {required} replica(s) acknowledged")]
    QuorumUnavailable { acks: usize, required: usize },

    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("output quality {score:.2} below threshold {threshold:.2}")]
    QualityBelowThreshold { score: f64, threshold: f64 },

    #[error("no handler registered for task type '{0}'")]
    NoHandler(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("component is shutting down")]
    ShuttingDown,
}

impl SwarmError {
    pub fn task_failed(msg: impl Into<String>) -> Self {
        SwarmError::TaskFailed(msg.into())
    }

    /// Both timeout kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SwarmError::TimedOutGraceful { .. } | SwarmError::TimedOutForced { .. }
        )
    }

    /// Stable short code used in task records and event summaries.
    pub fn code(&self) -> &'static str {
        match self {
            SwarmError::InvalidStrategy { .. } => "INVALID_STRATEGY",
            SwarmError::InvalidObjective(_) => "INVALID_OBJECTIVE",
            SwarmError::InsufficientAgents { .. } => "INSUFFICIENT_AGENTS",
            SwarmError::ResourceLimitExceeded { .. } => "RESOURCE_LIMIT_EXCEEDED",
            SwarmError::TimedOutGraceful { .. } => "TIMED_OUT_GRACEFUL",
            SwarmError::TimedOutForced { .. } => "TIMED_OUT_FORCED",
            SwarmError::Busy { .. } => "BUSY",
            SwarmError::WouldDeadlock { .. } => "WOULD_DEADLOCK",
            SwarmError::MessageTimeout { .. } => "MESSAGE_TIMEOUT",
            SwarmError::NotFound(_) => "NOT_FOUND",
            SwarmError::QuorumUnavailable { .. } => "QUORUM_UNAVAILABLE",
            SwarmError::SandboxViolation(_) => "SANDBOX_VIOLATION",
            SwarmError::QualityBelowThreshold { .. } => "QUALITY_BELOW_THRESHOLD",
            SwarmError::NoHandler(_) => "NO_HANDLER",
            SwarmError::TaskFailed(_) => "TASK_FAILED",
            SwarmError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

pub type SwarmResult<T> = std::result::Result<T, SwarmError>;
