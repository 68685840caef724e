//! Assignment policy for one scheduling tick.
//!
//! Everything here is a pure function of task and agent snapshots; the
//! coordinator loop applies the resulting assignments.

use std::cmp::{Ordering, Reverse};
use std::collections::{HashMap, HashSet};

use crate::config::{CoordinatorConfig, LoadBalancing, SelectionStrategy};
use crate::model::{Agent, AgentId, AgentStatus, ObjectiveId, Task, TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingPolicy {
    pub selection: SelectionStrategy,
    pub load_balancing: LoadBalancing,
    pub steal_after_idle_ticks: u32,
}

impl From<&CoordinatorConfig> for SchedulingPolicy {
    fn from(cfg: &CoordinatorConfig) -> Self {
        Self {
            selection: cfg.selection,
            load_balancing: cfg.load_balancing,
            steal_after_idle_ticks: cfg.steal_after_idle_ticks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    /// Busy agent the task was preferred for, when taken by work-stealing.
    pub stolen_from: Option<AgentId>,
}

/// Running count and cap for one objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectiveSlots {
    pub running: usize,
    pub max_running: usize,
}

/// Pending tasks whose dependencies have all completed.
pub fn ready_tasks<'a, I>(tasks: I, all: &HashMap<TaskId, Task>) -> Vec<TaskId>
where
    I: IntoIterator<Item = &'a Task>,
{
    tasks
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.dependencies.iter().all(|dep| {
                all.get(dep)
                    .map(|d| d.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
        })
        .map(|t| t.id.clone())
        .collect()
}

/// Queued first by priority (highest first), then creation order.
pub fn order_queued(tasks: &mut [&Task]) {
    tasks.sort_by_key(|t| (Reverse(t.priority), t.seq));
}

fn is_idle(agent: &Agent) -> bool {
    agent.status == AgentStatus::Idle && agent.current_task.is_none()
}

fn compare(selection: SelectionStrategy, a: &Agent, b: &Agent, rr_cursor: Option<u64>) -> Ordering {
    let load = |x: &Agent| x.completed_task_ids.len();
    match selection {
        SelectionStrategy::Capability => b
            .capabilities
            .priority
            .cmp(&a.capabilities.priority)
            .then(load(a).cmp(&load(b)))
            .then(a.seq.cmp(&b.seq)),
        SelectionStrategy::LeastLoaded => load(a)
            .cmp(&load(b))
            .then(b.capabilities.priority.cmp(&a.capabilities.priority))
            .then(a.seq.cmp(&b.seq)),
        SelectionStrategy::RoundRobin => {
            // Agents after the cursor come first, in registration order.
            let wrapped = |x: &Agent| match rr_cursor {
                Some(cursor) if x.seq <= cursor => (1u8, x.seq),
                _ => (0u8, x.seq),
            };
            wrapped(a).cmp(&wrapped(b))
        }
    }
}

/// Best agent of `candidates` under the selection policy.
pub fn select_agent<'a>(
    selection: SelectionStrategy,
    candidates: impl IntoIterator<Item = &'a Agent>,
    rr_cursor: Option<u64>,
) -> Option<&'a Agent> {
    candidates
        .into_iter()
        .min_by(|a, b| compare(selection, a, b, rr_cursor))
}

/// Outcome of one planning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub assignments: Vec<Assignment>,
    /// New or changed preferred agents of tasks left queued.
    pub preferences: Vec<(TaskId, AgentId)>,
}

/// Compute this tick's assignments for `queued` (already ordered).
///
/// A queued task keeps the preferred agent recorded in `assigned_agent`
/// while that agent stays eligible; otherwise a new one is picked: the best
/// eligible idle agent, else the best eligible busy one. The task runs when
/// its preferred agent is idle. Under work-stealing an agent that has been
/// idle for `steal_after_idle_ticks` and has no queue of its own takes a task
/// waiting on a busy peer. Agents that already failed a task are avoided
/// while an alternative exists.
pub fn plan_assignments(
    queued: &[&Task],
    agents: &[&Agent],
    slots: &mut HashMap<ObjectiveId, ObjectiveSlots>,
    idle_ticks: &HashMap<AgentId, u32>,
    policy: &SchedulingPolicy,
    rr_cursor: &mut Option<u64>,
) -> TickPlan {
    let mut taken: HashSet<AgentId> = HashSet::new();
    let mut deferred: Vec<(&Task, Vec<&Agent>, AgentId)> = Vec::new();
    let mut plan = TickPlan::default();

    let has_slot = |slots: &HashMap<ObjectiveId, ObjectiveSlots>, task: &Task| {
        slots
            .get(&task.objective_id)
            .map(|s| s.running < s.max_running)
            .unwrap_or(true)
    };
    let dispatch = |plan: &mut TickPlan,
                        slots: &mut HashMap<ObjectiveId, ObjectiveSlots>,
                        taken: &mut HashSet<AgentId>,
                        rr_cursor: &mut Option<u64>,
                        task: &Task,
                        agent: &Agent,
                        stolen_from: Option<AgentId>| {
        taken.insert(agent.id.clone());
        *rr_cursor = Some(agent.seq);
        if let Some(s) = slots.get_mut(&task.objective_id) {
            s.running += 1;
        }
        plan.assignments.push(Assignment {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            stolen_from,
        });
    };

    for &task in queued {
        let eligible: Vec<&Agent> = agents.iter().copied().filter(|a| a.can_take(task)).collect();
        if eligible.is_empty() {
            continue;
        }
        let fresh: Vec<&Agent> = eligible
            .iter()
            .copied()
            .filter(|a| !task.failed_agents.contains(&a.id))
            .collect();
        let pool = if fresh.is_empty() { eligible } else { fresh };

        let kept = task
            .assigned_agent
            .as_ref()
            .and_then(|id| pool.iter().copied().find(|a| &a.id == id));
        let preferred = match kept {
            Some(agent) => agent,
            None => {
                let idle = select_agent(
                    policy.selection,
                    pool.iter()
                        .copied()
                        .filter(|a| is_idle(a) && !taken.contains(&a.id)),
                    *rr_cursor,
                );
                let Some(agent) = idle.or_else(|| {
                    select_agent(policy.selection, pool.iter().copied(), *rr_cursor)
                }) else {
                    continue;
                };
                agent
            }
        };

        if is_idle(preferred) && !taken.contains(&preferred.id) && has_slot(slots, task) {
            dispatch(&mut plan, slots, &mut taken, rr_cursor, task, preferred, None);
            continue;
        }
        if task.assigned_agent.as_ref() != Some(&preferred.id) {
            plan.preferences.push((task.id.clone(), preferred.id.clone()));
        }
        deferred.push((task, pool, preferred.id.clone()));
    }

    if policy.load_balancing != LoadBalancing::WorkStealing {
        return plan;
    }

    // An idle agent with waiting tasks of its own does not steal.
    let mut own_queue: HashMap<AgentId, usize> = HashMap::new();
    for (_, _, preferred) in &deferred {
        *own_queue.entry(preferred.clone()).or_insert(0) += 1;
    }

    for (task, pool, preferred) in deferred {
        if !has_slot(slots, task) {
            continue;
        }
        let thief = select_agent(
            policy.selection,
            pool.iter().copied().filter(|a| {
                a.id != preferred
                    && is_idle(a)
                    && !taken.contains(&a.id)
                    && own_queue.get(&a.id).copied().unwrap_or(0) == 0
                    && idle_ticks.get(&a.id).copied().unwrap_or(0) >= policy.steal_after_idle_ticks
            }),
            *rr_cursor,
        );
        if let Some(agent) = thief {
            if let Some(n) = own_queue.get_mut(&preferred) {
                *n = n.saturating_sub(1);
            }
            dispatch(&mut plan, slots, &mut taken, rr_cursor, task, agent, Some(preferred));
        }
    }
    plan
}
