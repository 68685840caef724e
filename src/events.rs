use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

use crate::model::{AgentId, AgentStatus, ObjectiveId, ObjectiveOutcome, TaskId};
use crate::sync::lock;

/// Lifecycle events published by the coordinator for external monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SwarmEvent {
    ObjectiveAdded {
        ts_ms: u128,
        objective_id: ObjectiveId,
        strategy: String,
        task_count: usize,
    },
    ObjectiveStarted {
        ts_ms: u128,
        objective_id: ObjectiveId,
    },
    TaskStarted {
        ts_ms: u128,
        objective_id: ObjectiveId,
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    TaskCompleted {
        ts_ms: u128,
        objective_id: ObjectiveId,
        task_id: TaskId,
        agent_id: AgentId,
        elapsed_ms: u64,
    },
    TaskError {
        ts_ms: u128,
        objective_id: ObjectiveId,
        task_id: TaskId,
        agent_id: AgentId,
        error: String,
        will_retry: bool,
    },
    TaskCancelled {
        ts_ms: u128,
        objective_id: ObjectiveId,
        task_id: TaskId,
        reason: String,
    },
    AgentStatusChanged {
        ts_ms: u128,
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    WorkStolen {
        ts_ms: u128,
        task_id: TaskId,
        from_agent: AgentId,
        to_agent: AgentId,
    },
    ObjectiveFinished {
        ts_ms: u128,
        objective_id: ObjectiveId,
        outcome: ObjectiveOutcome,
        progress: f64,
    },
}

pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

impl SwarmEvent {
    pub fn ts_ms(&self) -> u128 {
        match self {
            SwarmEvent::ObjectiveAdded { ts_ms, .. }
            | SwarmEvent::ObjectiveStarted { ts_ms, .. }
            | SwarmEvent::TaskStarted { ts_ms, .. }
            | SwarmEvent::TaskCompleted { ts_ms, .. }
            | SwarmEvent::TaskError { ts_ms, .. }
            | SwarmEvent::TaskCancelled { ts_ms, .. }
            | SwarmEvent::AgentStatusChanged { ts_ms, .. }
            | SwarmEvent::WorkStolen { ts_ms, .. }
            | SwarmEvent::ObjectiveFinished { ts_ms, .. } => *ts_ms,
        }
    }

    /// Event name without payload, e.g. `TaskStarted`.
    pub fn name(&self) -> &'static str {
        match self {
            SwarmEvent::ObjectiveAdded { .. } => "ObjectiveAdded",
            SwarmEvent::ObjectiveStarted { .. } => "ObjectiveStarted",
            SwarmEvent::TaskStarted { .. } => "TaskStarted",
            SwarmEvent::TaskCompleted { .. } => "TaskCompleted",
            SwarmEvent::TaskError { .. } => "TaskError",
            SwarmEvent::TaskCancelled { .. } => "TaskCancelled",
            SwarmEvent::AgentStatusChanged { .. } => "AgentStatusChanged",
            SwarmEvent::WorkStolen { .. } => "WorkStolen",
            SwarmEvent::ObjectiveFinished { .. } => "ObjectiveFinished",
        }
    }

    /// One-line, diff-friendly rendering.
    pub fn summarize(&self) -> String {
        match self {
            SwarmEvent::ObjectiveAdded {
                ts_ms,
                objective_id,
                strategy,
                task_count,
            } => format!(
                "{ts_ms} ObjectiveAdded objective={objective_id} strategy={strategy} tasks={task_count}"
            ),
            SwarmEvent::ObjectiveStarted {
                ts_ms,
                objective_id,
            } => format!("{ts_ms} ObjectiveStarted objective={objective_id}"),
            SwarmEvent::TaskStarted {
                ts_ms,
                task_id,
                agent_id,
                attempt,
                ..
            } => format!("{ts_ms} TaskStarted task={task_id} agent={agent_id} attempt={attempt}"),
            SwarmEvent::TaskCompleted {
                ts_ms,
                task_id,
                agent_id,
                elapsed_ms,
                ..
            } => format!(
                "{ts_ms} TaskCompleted task={task_id} agent={agent_id} elapsed_ms={elapsed_ms}"
            ),
            SwarmEvent::TaskError {
                ts_ms,
                task_id,
                agent_id,
                error,
                will_retry,
                ..
            } => format!(
                "{ts_ms} TaskError task={task_id} agent={agent_id} retry={will_retry} error={error}"
            ),
            SwarmEvent::TaskCancelled {
                ts_ms,
                task_id,
                reason,
                ..
            } => format!("{ts_ms} TaskCancelled task={task_id} reason={reason}"),
            SwarmEvent::AgentStatusChanged {
                ts_ms,
                agent_id,
                from,
                to,
            } => format!("{ts_ms} AgentStatusChanged agent={agent_id} from={from:?} to={to:?}"),
            SwarmEvent::WorkStolen {
                ts_ms,
                task_id,
                from_agent,
                to_agent,
            } => format!(
                "{ts_ms} WorkStolen task={task_id} from={from_agent} to={to_agent}"
            ),
            SwarmEvent::ObjectiveFinished {
                ts_ms,
                objective_id,
                outcome,
                progress,
            } => format!(
                "{ts_ms} ObjectiveFinished objective={objective_id} outcome={outcome:?} progress={progress:.2}"
            ),
        }
    }
}

/// Publish/subscribe fan-out with a bounded history for late pollers.
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<SwarmEvent>>>,
    history: Mutex<VecDeque<SwarmEvent>>,
    history_limit: usize,
}

impl EventBus {
    pub fn new(history_limit: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit,
        }
    }

    pub fn subscribe(&self) -> Receiver<SwarmEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: SwarmEvent) {
        trace!(event = %event.summarize(), "publish");
        {
            let mut history = lock(&self.history);
            if self.history_limit > 0 {
                if history.len() == self.history_limit {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<SwarmEvent> {
        let history = lock(&self.history);
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}
