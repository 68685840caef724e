//! Turns an objective into a dependency graph of tasks.
//!
//! Recognized strategies expand a fixed template; callers may instead supply
//! an explicit graph in `requirements.tasks`.

use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{SwarmError, SwarmResult};
use crate::model::{new_id, ObjectiveId, ObjectiveRequirements, Strategy, Task, TaskSpec, TaskStatus};

struct TemplateTask {
    name: &'static str,
    agent_type: &'static str,
    depends_on: &'static [&'static str],
    priority: i32,
}

struct StrategyTemplate {
    agent_types: &'static [&'static str],
    tasks: &'static [TemplateTask],
}

const GENERALIST_TYPES: &[&str] = &["coordinator", "developer", "tester"];

static TEMPLATES: Lazy<BTreeMap<&'static str, StrategyTemplate>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    m.insert(
        "development",
        StrategyTemplate {
            agent_types: &["developer", "tester", "reviewer", "documenter"],
            tasks: &[
                TemplateTask { name: "design", agent_type: "developer", depends_on: &[], priority: 3 },
                TemplateTask { name: "implement", agent_type: "developer", depends_on: &["design"], priority: 2 },
                TemplateTask { name: "test", agent_type: "tester", depends_on: &["implement"], priority: 1 },
                TemplateTask { name: "review", agent_type: "reviewer", depends_on: &["implement"], priority: 1 },
                TemplateTask { name: "document", agent_type: "documenter", depends_on: &["test", "review"], priority: 0 },
            ],
        },
    );
    m.insert(
        "research",
        StrategyTemplate {
            agent_types: &["researcher", "analyzer", "documenter"],
            tasks: &[
                TemplateTask { name: "gather", agent_type: "researcher", depends_on: &[], priority: 2 },
                TemplateTask { name: "analyze", agent_type: "analyzer", depends_on: &["gather"], priority: 1 },
                TemplateTask { name: "report", agent_type: "documenter", depends_on: &["analyze"], priority: 0 },
            ],
        },
    );
    m.insert(
        "analysis",
        StrategyTemplate {
            agent_types: &["analyzer", "researcher", "documenter"],
            tasks: &[
                TemplateTask { name: "collect", agent_type: "researcher", depends_on: &[], priority: 2 },
                TemplateTask { name: "analyze", agent_type: "analyzer", depends_on: &["collect"], priority: 1 },
                TemplateTask { name: "summarize", agent_type: "documenter", depends_on: &["analyze"], priority: 0 },
            ],
        },
    );
    m.insert(
        "testing",
        StrategyTemplate {
            agent_types: &["tester", "documenter"],
            tasks: &[
                TemplateTask { name: "plan_tests", agent_type: "tester", depends_on: &[], priority: 2 },
                TemplateTask { name: "run_tests", agent_type: "tester", depends_on: &["plan_tests"], priority: 1 },
                TemplateTask { name: "report", agent_type: "documenter", depends_on: &["run_tests"], priority: 0 },
            ],
        },
    );
    m.insert(
        "optimization",
        StrategyTemplate {
            agent_types: &["analyzer", "developer", "tester"],
            tasks: &[
                TemplateTask { name: "profile", agent_type: "analyzer", depends_on: &[], priority: 2 },
                TemplateTask { name: "optimize", agent_type: "developer", depends_on: &["profile"], priority: 1 },
                TemplateTask { name: "benchmark", agent_type: "tester", depends_on: &["optimize"], priority: 0 },
            ],
        },
    );
    m.insert(
        "maintenance",
        StrategyTemplate {
            agent_types: &["reviewer", "developer", "tester", "documenter"],
            tasks: &[
                TemplateTask { name: "assess", agent_type: "reviewer", depends_on: &[], priority: 3 },
                TemplateTask { name: "fix", agent_type: "developer", depends_on: &["assess"], priority: 2 },
                TemplateTask { name: "verify", agent_type: "tester", depends_on: &["fix"], priority: 1 },
                TemplateTask { name: "document", agent_type: "documenter", depends_on: &["verify"], priority: 0 },
            ],
        },
    );
    m
});

/// Agent types and task specs an objective expands to.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub agent_types: Vec<String>,
    pub tasks: Vec<TaskSpec>,
}

fn normalized_types(types: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    types
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Agent types an objective needs. Explicit requirement types win over the
/// strategy's defaults.
pub fn agent_types_for(
    strategy: &Strategy,
    requirements: &ObjectiveRequirements,
) -> SwarmResult<Vec<String>> {
    let explicit = normalized_types(&requirements.agent_types);
    if !explicit.is_empty() {
        return Ok(explicit);
    }
    match strategy {
        Strategy::Custom(name) => Err(SwarmError::InvalidStrategy {
            strategy: name.clone(),
        }),
        Strategy::Auto => Ok(GENERALIST_TYPES.iter().map(|t| t.to_string()).collect()),
        other => Ok(TEMPLATES
            .get(other.as_str())
            .map(|t| t.agent_types.iter().map(|a| a.to_string()).collect())
            .unwrap_or_else(|| GENERALIST_TYPES.iter().map(|t| t.to_string()).collect())),
    }
}

/// One step per agent type, each depending on the previous one.
fn pipeline(agent_types: &[String], description: &str) -> Vec<TaskSpec> {
    let mut out: Vec<TaskSpec> = Vec::with_capacity(agent_types.len());
    let total = agent_types.len() as i32;
    for (i, agent_type) in agent_types.iter().enumerate() {
        let name = format!("{agent_type}_step");
        let mut spec = TaskSpec::new(&name, agent_type)
            .priority(total - i as i32)
            .skill(agent_type);
        spec.description = format!("{name}: {description}");
        if let Some(prev) = out.last() {
            spec = spec.depends_on(prev.name.clone());
        }
        out.push(spec);
    }
    out
}

fn template_tasks(strategy: &Strategy, description: &str) -> Option<Vec<TaskSpec>> {
    let template = TEMPLATES.get(strategy.as_str())?;
    Some(
        template
            .tasks
            .iter()
            .map(|t| {
                let mut spec = TaskSpec::new(t.name, t.agent_type)
                    .priority(t.priority)
                    .skill(t.agent_type);
                spec.description = format!("{}: {description}", t.name);
                spec.depends_on = t.depends_on.iter().map(|d| d.to_string()).collect();
                spec
            })
            .collect(),
    )
}

pub fn decompose(
    description: &str,
    strategy: &Strategy,
    requirements: &ObjectiveRequirements,
) -> SwarmResult<Decomposition> {
    let agent_types = agent_types_for(strategy, requirements)?;
    let tasks = if !requirements.tasks.is_empty() {
        validate_task_specs(&requirements.tasks)?;
        requirements.tasks.clone()
    } else {
        match strategy {
            Strategy::Auto | Strategy::Custom(_) => pipeline(&agent_types, description),
            other => template_tasks(other, description)
                .unwrap_or_else(|| pipeline(&agent_types, description)),
        }
    };
    Ok(Decomposition { agent_types, tasks })
}

/// Names unique and non-empty, dependencies known, graph acyclic.
pub fn validate_task_specs(specs: &[TaskSpec]) -> SwarmResult<()> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();

    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(SwarmError::InvalidObjective(
                "task names must be non-empty".to_string(),
            ));
        }
        if indegree.insert(spec.name.as_str(), 0).is_some() {
            return Err(SwarmError::InvalidObjective(format!(
                "duplicate task name '{}'",
                spec.name
            )));
        }
        outgoing.entry(spec.name.as_str()).or_default();
    }

    for spec in specs {
        for dep in &spec.depends_on {
            if !indegree.contains_key(dep.as_str()) {
                return Err(SwarmError::InvalidObjective(format!(
                    "task '{}' depends on unknown task '{}'",
                    spec.name, dep
                )));
            }
            *indegree.entry(spec.name.as_str()).or_insert(0) += 1;
            outgoing
                .entry(dep.as_str())
                .or_default()
                .push(spec.name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter_map(|(name, &deg)| if deg == 0 { Some(*name) } else { None })
        .collect();

    let mut seen = 0usize;
    while let Some(name) = queue.pop_front() {
        seen += 1;
        for next in outgoing.get(name).into_iter().flatten() {
            let deg = indegree.get_mut(next).ok_or_else(|| {
                SwarmError::InvalidObjective(format!("internal graph error at task '{next}'"))
            })?;
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(next);
            }
        }
    }

    if seen != specs.len() {
        return Err(SwarmError::InvalidObjective(format!(
            "task graph contains a dependency cycle ({} of {} tasks resolved)",
            seen,
            specs.len()
        )));
    }
    Ok(())
}

/// Materialize specs into pending tasks. Dependency names become task ids;
/// `next_seq` provides creation order across objectives.
pub fn instantiate(objective_id: &ObjectiveId, specs: &[TaskSpec], next_seq: &mut u64) -> Vec<Task> {
    let ids: HashMap<&str, String> = specs
        .iter()
        .map(|s| (s.name.as_str(), new_id("task")))
        .collect();
    specs
        .iter()
        .map(|spec| {
            let seq = *next_seq;
            *next_seq += 1;
            let dependencies: BTreeSet<String> = spec
                .depends_on
                .iter()
                .filter_map(|d| ids.get(d.as_str()).cloned())
                .collect();
            Task {
                id: ids.get(spec.name.as_str()).cloned().unwrap_or_else(|| new_id("task")),
                objective_id: objective_id.clone(),
                name: spec.name.clone(),
                task_type: spec.task_type.clone(),
                description: spec.description.clone(),
                priority: spec.priority,
                status: TaskStatus::Pending,
                dependencies,
                required_skills: spec.required_skills.clone(),
                resources: spec.resources.clone(),
                assigned_agent: None,
                input: spec.input.clone(),
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
                retry_count: 0,
                timeout_ms: spec.timeout_ms,
                failed_agents: Vec::new(),
                seq,
            }
        })
        .collect()
}
