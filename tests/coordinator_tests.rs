use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use swarm::config::{Consistency, FailurePolicy, LoadBalancing, MemoryConfig};
use swarm::coordinator::{result_key, result_namespace};
use swarm::model::{AgentStatus, ObjectiveStatus};
use swarm::snapshot::{load_status, load_task_record, PROGRESS_FILE, STATUS_FILE, TASKS_DIR};
use swarm::{
    AgentCapabilities, ExecutionContext, ObjectiveOutcome, ObjectiveRequirements, SwarmConfig,
    SwarmCoordinator, SwarmError, SwarmEvent, SwarmResult, Task, TaskHandler, TaskSpec,
    TaskStatus,
};

mod helpers;
use helpers::{fast_config, sleep_handler, unique_test_temp_dir, FlakyHandler, OrderLog};

const SETTLE: Duration = Duration::from_secs(10);

fn requirements(tasks: Vec<TaskSpec>) -> ObjectiveRequirements {
    ObjectiveRequirements {
        agent_types: vec!["worker".to_string()],
        max_retries: Some(0),
        tasks,
        ..ObjectiveRequirements::default()
    }
}

fn add_workers(swarm: &SwarmCoordinator, n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            swarm
                .register_agent(&format!("worker-{i}"), "worker", AgentCapabilities::default())
                .expect("register agent")
        })
        .collect()
}

fn task_named(swarm: &SwarmCoordinator, objective_id: &str, name: &str) -> Task {
    swarm
        .get_objective_tasks(objective_id)
        .expect("objective tasks")
        .into_iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no task named {name}"))
}

fn run_to_outcome(swarm: &SwarmCoordinator, objective_id: &str) -> ObjectiveOutcome {
    swarm.execute(objective_id).expect("execute");
    swarm
        .wait_for_objective(objective_id, SETTLE)
        .expect("wait")
        .expect("objective settled in time")
}

/// Tracks how many handler invocations overlap.
fn concurrency_tracker(sleep_ms: u64) -> (Arc<dyn TaskHandler>, Arc<AtomicUsize>) {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let handler: Arc<dyn TaskHandler> =
        Arc::new(move |task: &Task, _: &ExecutionContext| -> SwarmResult<String> {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(sleep_ms));
            a.fetch_sub(1, Ordering::SeqCst);
            Ok(task.name.clone())
        });
    (handler, peak)
}

#[test]
fn independent_tasks_complete_on_two_agents() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.set_default_handler(sleep_handler(20));
    let id = swarm
        .create_objective(
            "three independent tasks",
            "auto",
            requirements(vec![
                TaskSpec::new("a", "work"),
                TaskSpec::new("b", "work"),
                TaskSpec::new("c", "work"),
            ]),
        )
        .expect("create");
    add_workers(&swarm, 2);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    let status = swarm.get_status();
    assert_eq!(status.completed_tasks, 3);
    assert_eq!(status.failed_tasks, 0);
    let objective = swarm.get_objective(&id).expect("objective");
    assert_eq!(objective.status, ObjectiveStatus::Completed);
    assert!((objective.progress - 1.0).abs() < f64::EPSILON);

    let stored = swarm
        .memory()
        .get(&result_namespace(&id), &result_key("a"))
        .expect("result stored");
    assert_eq!(String::from_utf8_lossy(&stored), "a slept 20ms");
    let metrics = swarm.get_metrics();
    assert_eq!(metrics.tasks_completed, 3);
    assert_eq!(metrics.objectives_completed, 1);
    assert!(metrics.scheduler_ticks > 0);
    swarm.shutdown().expect("shutdown");
}

#[test]
fn chain_retries_failed_root_and_keeps_order() {
    let swarm = SwarmCoordinator::new(fast_config());
    let flaky = FlakyHandler::new([("a", 2)]);
    swarm.set_default_handler(flaky.clone());
    let mut reqs = requirements(vec![
        TaskSpec::new("a", "work"),
        TaskSpec::new("b", "work").depends_on("a"),
        TaskSpec::new("c", "work").depends_on("b"),
    ]);
    reqs.max_retries = Some(2);
    let id = swarm.create_objective("chain", "auto", reqs).expect("create");
    add_workers(&swarm, 1);
    let events = swarm.subscribe();

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    let a = task_named(&swarm, &id, "a");
    assert_eq!(a.retry_count, 2);
    assert_eq!(flaky.attempts("a"), 3);
    assert_eq!(flaky.attempts("b"), 1);
    assert_eq!(flaky.attempts("c"), 1);

    let names: HashMap<String, String> = swarm
        .get_objective_tasks(&id)
        .expect("tasks")
        .into_iter()
        .map(|t| (t.id, t.name))
        .collect();
    let completed: Vec<String> = events
        .try_iter()
        .filter_map(|e| match e {
            SwarmEvent::TaskCompleted { task_id, .. } => names.get(&task_id).cloned(),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["a", "b", "c"]);
    assert_eq!(swarm.get_metrics().tasks_retried, 2);
    swarm.shutdown().expect("shutdown");
}

#[test]
fn diamond_dependencies_gate_dispatch() {
    let swarm = SwarmCoordinator::new(fast_config());
    let log = OrderLog::new();
    swarm.set_default_handler(log.handler(15));
    let id = swarm
        .create_objective(
            "diamond",
            "auto",
            requirements(vec![
                TaskSpec::new("root", "work"),
                TaskSpec::new("left", "work").depends_on("root"),
                TaskSpec::new("right", "work").depends_on("root"),
                TaskSpec::new("join", "work").depends_on("left").depends_on("right"),
            ]),
        )
        .expect("create");
    add_workers(&swarm, 3);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    let pos = |e: &str| log.position(e).unwrap_or_else(|| panic!("missing {e}"));
    assert!(pos("end:root") < pos("start:left"));
    assert!(pos("end:root") < pos("start:right"));
    assert!(pos("end:left") < pos("start:join"));
    assert!(pos("end:right") < pos("start:join"));
    swarm.shutdown().expect("shutdown");
}

#[test]
fn agents_run_one_task_at_a_time() {
    let swarm = SwarmCoordinator::new(fast_config());
    let (handler, peak) = concurrency_tracker(25);
    swarm.set_default_handler(handler);
    let specs = (0..6).map(|i| TaskSpec::new(format!("t{i}"), "work")).collect();
    let id = swarm
        .create_objective("six tasks", "auto", requirements(specs))
        .expect("create");
    let agents = add_workers(&swarm, 2);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    let done: usize = agents
        .iter()
        .map(|a| swarm.get_agent(a).expect("agent").completed_task_ids.len())
        .sum();
    assert_eq!(done, 6);
    swarm.shutdown().expect("shutdown");
}

#[test]
fn max_agents_caps_running_tasks_per_objective() {
    let swarm = SwarmCoordinator::new(fast_config());
    let (handler, peak) = concurrency_tracker(20);
    swarm.set_default_handler(handler);
    let mut reqs = requirements((0..4).map(|i| TaskSpec::new(format!("t{i}"), "work")).collect());
    reqs.max_agents = Some(1);
    let id = swarm.create_objective("capped", "auto", reqs).expect("create");
    add_workers(&swarm, 3);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    swarm.shutdown().expect("shutdown");
}

fn failing_root_objective(swarm: &SwarmCoordinator, policy: FailurePolicy) -> String {
    let failing: Arc<dyn TaskHandler> =
        Arc::new(|task: &Task, _: &ExecutionContext| -> SwarmResult<String> {
            if task.name == "root" {
                Err(SwarmError::task_failed("root broke"))
            } else {
                Ok(task.name.clone())
            }
        });
    swarm.set_default_handler(failing);
    let mut reqs = requirements(vec![
        TaskSpec::new("root", "work").priority(5),
        TaskSpec::new("child", "work").depends_on("root"),
        TaskSpec::new("grandchild", "work").depends_on("child"),
        TaskSpec::new("side", "work").priority(1),
    ]);
    reqs.failure_policy = Some(policy);
    let id = swarm.create_objective("fragile", "auto", reqs).expect("create");
    add_workers(&swarm, 1);
    id
}

#[test]
fn fail_fast_cancels_dependents_and_remaining_tasks() {
    let swarm = SwarmCoordinator::new(fast_config());
    let id = failing_root_objective(&swarm, FailurePolicy::FailFast);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Failed);
    let objective = swarm.get_objective(&id).expect("objective");
    assert_eq!(objective.status, ObjectiveStatus::Failed);
    assert_eq!(task_named(&swarm, &id, "root").status, TaskStatus::Failed);
    for name in ["child", "grandchild"] {
        let task = task_named(&swarm, &id, name);
        assert_eq!(task.status, TaskStatus::Cancelled, "{name}");
        assert_eq!(task.error.as_deref(), Some("dependency failed"));
    }
    let side = task_named(&swarm, &id, "side");
    assert_eq!(side.status, TaskStatus::Cancelled);
    assert_eq!(side.error.as_deref(), Some("objective failed"));
    assert_eq!(swarm.get_metrics().tasks_cancelled, 3);
    swarm.shutdown().expect("shutdown");
}

#[test]
fn continue_policy_settles_partially_completed() {
    let swarm = SwarmCoordinator::new(fast_config());
    let id = failing_root_objective(&swarm, FailurePolicy::Continue);

    assert_eq!(
        run_to_outcome(&swarm, &id),
        ObjectiveOutcome::PartiallyCompleted
    );
    assert_eq!(task_named(&swarm, &id, "root").status, TaskStatus::Failed);
    assert_eq!(task_named(&swarm, &id, "child").status, TaskStatus::Pending);
    assert_eq!(task_named(&swarm, &id, "grandchild").status, TaskStatus::Pending);
    assert_eq!(task_named(&swarm, &id, "side").status, TaskStatus::Completed);
    let objective = swarm.get_objective(&id).expect("objective");
    assert_eq!(objective.status, ObjectiveStatus::Executing);
    assert!((objective.progress - 0.25).abs() < 1e-9);
    swarm.shutdown().expect("shutdown");
}

#[test]
fn max_duration_stops_dispatch_and_waits_for_in_flight_work() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.set_default_handler(sleep_handler(10));
    let mut reqs = requirements(vec![
        TaskSpec::new("slow", "work").input(json!({"sleep_ms": 250})),
        TaskSpec::new("after", "work").depends_on("slow"),
    ]);
    reqs.max_duration_ms = Some(80);
    let id = swarm.create_objective("deadline", "auto", reqs).expect("create");
    add_workers(&swarm, 1);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::TimedOut);
    assert_eq!(task_named(&swarm, &id, "slow").status, TaskStatus::Completed);
    assert_eq!(task_named(&swarm, &id, "after").status, TaskStatus::Pending);
    swarm.shutdown().expect("shutdown");
}

fn stealing_setup(load_balancing: LoadBalancing) -> (SwarmCoordinator, String, String, String) {
    let mut cfg: SwarmConfig = fast_config();
    cfg.coordinator.load_balancing = load_balancing;
    cfg.coordinator.steal_after_idle_ticks = 2;
    let swarm = SwarmCoordinator::new(cfg);
    swarm.set_default_handler(sleep_handler(10));
    let id = swarm
        .create_objective(
            "uneven",
            "auto",
            requirements(vec![
                TaskSpec::new("long", "work")
                    .priority(3)
                    .input(json!({"sleep_ms": 400})),
                TaskSpec::new("short", "work").priority(2),
                TaskSpec::new("waiting", "work").priority(1),
            ]),
        )
        .expect("create");
    let fast = swarm
        .register_agent(
            "fast",
            "worker",
            AgentCapabilities::default().priority(10),
        )
        .expect("fast");
    let slow = swarm
        .register_agent("slow", "worker", AgentCapabilities::default())
        .expect("slow");
    (swarm, id, fast, slow)
}

#[test]
fn idle_agent_steals_task_waiting_on_busy_peer() {
    let (swarm, id, fast, slow) = stealing_setup(LoadBalancing::WorkStealing);
    let events = swarm.subscribe();

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    assert_eq!(task_named(&swarm, &id, "long").assigned_agent.as_deref(), Some(fast.as_str()));
    let waiting = task_named(&swarm, &id, "waiting");
    assert_eq!(waiting.assigned_agent.as_deref(), Some(slow.as_str()));
    assert_eq!(swarm.get_metrics().work_steals, 1);
    let stolen = events.try_iter().any(|e| {
        matches!(e, SwarmEvent::WorkStolen { ref task_id, ref from_agent, ref to_agent, .. }
            if task_id == &waiting.id && from_agent == &fast && to_agent == &slow)
    });
    assert!(stolen);
    swarm.shutdown().expect("shutdown");
}

#[test]
fn static_balancing_waits_for_preferred_agent() {
    let (swarm, id, fast, _slow) = stealing_setup(LoadBalancing::Static);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    let waiting = task_named(&swarm, &id, "waiting");
    assert_eq!(waiting.assigned_agent.as_deref(), Some(fast.as_str()));
    assert_eq!(swarm.get_metrics().work_steals, 0);
    swarm.shutdown().expect("shutdown");
}

#[test]
fn retry_prefers_a_different_agent() {
    let swarm = SwarmCoordinator::new(fast_config());
    let flaky = FlakyHandler::new([("once", 1)]);
    swarm.set_default_handler(flaky.clone());
    let mut reqs = requirements(vec![TaskSpec::new("once", "work")]);
    reqs.max_retries = Some(1);
    let id = swarm.create_objective("retry", "auto", reqs).expect("create");
    add_workers(&swarm, 2);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    let task = task_named(&swarm, &id, "once");
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.failed_agents.len(), 1);
    assert_ne!(task.assigned_agent.as_ref(), Some(&task.failed_agents[0]));
    swarm.shutdown().expect("shutdown");
}

#[test]
fn agent_is_marked_error_past_threshold() {
    let mut cfg = fast_config();
    cfg.coordinator.agent_error_threshold = 0;
    let swarm = SwarmCoordinator::new(cfg);
    swarm.set_default_handler(FlakyHandler::new([("shaky", 1)]));
    let mut reqs = requirements(vec![TaskSpec::new("shaky", "work")]);
    reqs.max_retries = Some(1);
    let id = swarm.create_objective("errors", "auto", reqs).expect("create");
    add_workers(&swarm, 2);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    let task = task_named(&swarm, &id, "shaky");
    let broken = swarm.get_agent(&task.failed_agents[0]).expect("agent");
    assert_eq!(broken.status, AgentStatus::Error);
    assert_eq!(broken.error_count, 1);
    swarm.shutdown().expect("shutdown");
}

#[test]
fn low_quality_output_fails_the_attempt() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.set_default_handler(Arc::new(
        |_: &Task, ctx: &ExecutionContext| -> SwarmResult<String> {
            ctx.set_quality(0.4);
            Ok("meh".to_string())
        },
    ));
    let mut reqs = requirements(vec![TaskSpec::new("draft", "work")]);
    reqs.quality_threshold = 0.8;
    let id = swarm.create_objective("quality", "auto", reqs).expect("create");
    add_workers(&swarm, 1);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Failed);
    let task = task_named(&swarm, &id, "draft");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.error.as_deref().unwrap_or_default().contains("below threshold"),
        "{:?}",
        task.error
    );
    assert!(swarm
        .memory()
        .get(&result_namespace(&id), &result_key("draft"))
        .is_err());
    swarm.shutdown().expect("shutdown");
}

#[test]
fn agent_tools_are_granted_to_its_attempts() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.set_default_handler(Arc::new(
        |_: &Task, ctx: &ExecutionContext| -> SwarmResult<String> {
            ctx.check_tool("curl")?;
            Ok("fetched".to_string())
        },
    ));
    let id = swarm
        .create_objective("fetch", "auto", requirements(vec![TaskSpec::new("get", "work")]))
        .expect("create");
    swarm
        .register_agent("fetcher", "worker", AgentCapabilities::default().tool("curl"))
        .expect("register");

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    assert_eq!(task_named(&swarm, &id, "get").result.as_deref(), Some("fetched"));

    // Without the tool on the agent the same handler is refused.
    let plain = SwarmCoordinator::new(fast_config());
    plain.set_default_handler(Arc::new(
        |_: &Task, ctx: &ExecutionContext| -> SwarmResult<String> {
            ctx.check_tool("curl")?;
            Ok("fetched".to_string())
        },
    ));
    let id = plain
        .create_objective("fetch", "auto", requirements(vec![TaskSpec::new("get", "work")]))
        .expect("create");
    add_workers(&plain, 1);
    assert_eq!(run_to_outcome(&plain, &id), ObjectiveOutcome::Failed);
    assert!(task_named(&plain, &id, "get")
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("sandbox violation"));
    plain.shutdown().expect("shutdown");
    swarm.shutdown().expect("shutdown");
}

#[test]
fn result_write_without_quorum_fails_the_attempt() {
    let swarm = SwarmCoordinator::new(SwarmConfig {
        memory: MemoryConfig {
            consistency: Consistency::Strong,
            replication_factor: 3,
            ..fast_config().memory
        },
        ..fast_config()
    });
    swarm.set_default_handler(sleep_handler(5));
    let id = swarm
        .create_objective("store", "auto", requirements(vec![TaskSpec::new("a", "work")]))
        .expect("create");
    add_workers(&swarm, 1);
    swarm
        .memory()
        .set_replica_available(1, false)
        .expect("partition");

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Failed);
    let task = task_named(&swarm, &id, "a");
    assert!(
        task.error.as_deref().unwrap_or_default().contains("quorum unavailable"),
        "{:?}",
        task.error
    );
    assert_eq!(swarm.get_status().failed_tasks, 1);

    swarm.memory().set_replica_available(1, true).expect("heal");
    let id = swarm
        .create_objective("store again", "auto", requirements(vec![TaskSpec::new("b", "work")]))
        .expect("create");
    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    assert_eq!(
        swarm
            .memory()
            .get(&result_namespace(&id), &result_key("b"))
            .expect("stored with quorum"),
        b"b slept 5ms"
    );
    swarm.shutdown().expect("shutdown");
}

#[test]
fn missing_handler_fails_task() {
    let swarm = SwarmCoordinator::new(fast_config());
    let id = swarm
        .create_objective("unhandled", "auto", requirements(vec![TaskSpec::new("x", "mystery")]))
        .expect("create");
    add_workers(&swarm, 1);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Failed);
    let task = task_named(&swarm, &id, "x");
    assert!(task
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("no handler registered for task type 'mystery'"));
    swarm.shutdown().expect("shutdown");
}

#[test]
fn handlers_are_routed_by_task_type() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.register_handler(
        "build",
        Arc::new(|_: &Task, _: &ExecutionContext| -> SwarmResult<String> {
            Ok("built".to_string())
        }),
    );
    swarm.register_handler(
        "test",
        Arc::new(|_: &Task, _: &ExecutionContext| -> SwarmResult<String> {
            Ok("tested".to_string())
        }),
    );
    let id = swarm
        .create_objective(
            "typed",
            "auto",
            requirements(vec![
                TaskSpec::new("compile", "build"),
                TaskSpec::new("verify", "test").depends_on("compile"),
            ]),
        )
        .expect("create");
    add_workers(&swarm, 1);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    assert_eq!(task_named(&swarm, &id, "compile").result.as_deref(), Some("built"));
    assert_eq!(task_named(&swarm, &id, "verify").result.as_deref(), Some("tested"));
    swarm.shutdown().expect("shutdown");
}

#[test]
fn strategy_template_runs_to_completion() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.set_default_handler(sleep_handler(5));
    let id = swarm
        .create_objective("improve the docs", "testing", ObjectiveRequirements::default())
        .expect("create");
    let objective = swarm.get_objective(&id).expect("objective");
    for agent_type in &objective.required_agent_types {
        swarm
            .register_agent(agent_type, agent_type, AgentCapabilities::default())
            .expect("agent");
    }

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    let tasks = swarm.get_objective_tasks(&id).expect("tasks");
    assert!(!tasks.is_empty());
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    swarm.shutdown().expect("shutdown");
}

#[test]
fn execute_twice_and_cleanup_rules() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.set_default_handler(sleep_handler(100));
    let id = swarm
        .create_objective("once", "auto", requirements(vec![TaskSpec::new("t", "work")]))
        .expect("create");
    add_workers(&swarm, 1);
    swarm.execute(&id).expect("execute");

    assert!(matches!(
        swarm.execute(&id),
        Err(SwarmError::InvalidObjective(_))
    ));
    assert!(matches!(
        swarm.cleanup_objective(&id),
        Err(SwarmError::InvalidObjective(_))
    ));

    assert_eq!(
        swarm.wait_for_objective(&id, SETTLE).expect("wait"),
        Some(ObjectiveOutcome::Completed)
    );
    swarm.cleanup_objective(&id).expect("cleanup");
    assert!(matches!(swarm.get_objective(&id), Err(SwarmError::NotFound(_))));
    assert!(swarm.get_tasks().is_empty());
    // Results outlive the objective record.
    assert!(swarm
        .memory()
        .get(&result_namespace(&id), &result_key("t"))
        .is_ok());
    swarm.shutdown().expect("shutdown");
}

#[test]
fn lifecycle_events_are_published_in_order() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.set_default_handler(sleep_handler(5));
    let events = swarm.subscribe();
    let id = swarm
        .create_objective("events", "auto", requirements(vec![TaskSpec::new("only", "work")]))
        .expect("create");
    add_workers(&swarm, 1);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    let names: Vec<&'static str> = events
        .try_iter()
        .filter(|e| !matches!(e, SwarmEvent::AgentStatusChanged { .. }))
        .map(|e| e.name())
        .collect();
    assert_eq!(
        names,
        vec![
            "ObjectiveAdded",
            "ObjectiveStarted",
            "TaskStarted",
            "TaskCompleted",
            "ObjectiveFinished"
        ]
    );
    assert!(swarm
        .recent_events(10)
        .iter()
        .all(|e| !e.summarize().is_empty()));
    swarm.shutdown().expect("shutdown");
}

#[test]
fn snapshots_are_written_to_run_dir() {
    let run_dir = unique_test_temp_dir("snapshots");
    let mut cfg = fast_config();
    cfg.coordinator.run_dir = Some(run_dir.clone());
    let swarm = SwarmCoordinator::new(cfg);
    swarm.set_default_handler(sleep_handler(5));
    let id = swarm
        .create_objective(
            "snapshot me",
            "auto",
            requirements(vec![TaskSpec::new("one", "work"), TaskSpec::new("two", "work")]),
        )
        .expect("create");
    add_workers(&swarm, 1);

    assert_eq!(run_to_outcome(&swarm, &id), ObjectiveOutcome::Completed);
    swarm.shutdown().expect("shutdown");

    let status = load_status(&run_dir.join(STATUS_FILE)).expect("status.json");
    assert_eq!(status.status.completed_tasks, 2);
    assert_eq!(status.objectives[0].outcome, Some(ObjectiveOutcome::Completed));
    for task in swarm.get_tasks() {
        let record = load_task_record(&run_dir.join(TASKS_DIR).join(format!("{}.json", task.id)))
            .expect("task record");
        assert_eq!(record.status, TaskStatus::Completed);
    }
    let progress = fs::read_to_string(run_dir.join(PROGRESS_FILE)).expect("progress.md");
    assert!(progress.contains("snapshot me"), "{progress}");
    let _ = fs::remove_dir_all(&run_dir);
}

#[test]
fn shutdown_lets_in_flight_work_finish() {
    let swarm = SwarmCoordinator::new(fast_config());
    swarm.set_default_handler(sleep_handler(150));
    let id = swarm
        .create_objective("drain", "auto", requirements(vec![TaskSpec::new("busy", "work")]))
        .expect("create");
    add_workers(&swarm, 1);
    swarm.execute(&id).expect("execute");
    assert!(helpers::wait_until(Duration::from_secs(5), || {
        swarm.get_status().active_tasks == 1
    }));

    swarm.shutdown().expect("shutdown");
    assert_eq!(task_named(&swarm, &id, "busy").status, TaskStatus::Completed);
    assert!(matches!(
        swarm.create_objective("late", "auto", ObjectiveRequirements::default()),
        Err(SwarmError::ShuttingDown)
    ));
}
