//! Run-directory snapshots: `status.json`, one `tasks/<task_id>.json` per task
//! and a human-readable `progress.md`.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{Agent, Objective, SwarmMetrics, SwarmStatus, Task, TaskStatus};
use crate::sync::lock;

pub const STATUS_FILE: &str = "status.json";
pub const PROGRESS_FILE: &str = "progress.md";
pub const TASKS_DIR: &str = "tasks";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub status: SwarmStatus,
    pub metrics: SwarmMetrics,
    pub objectives: Vec<Objective>,
    pub agents: Vec<Agent>,
}

/// Everything one snapshot writes.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub status: StatusSnapshot,
    pub tasks: Vec<Task>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serialize snapshot record '{}'", path.display()))?;
    fs::write(path, body)
        .with_context(|| format!("failed writing snapshot record '{}'", path.display()))
}

pub fn write_snapshot(run_dir: &Path, data: &SnapshotData) -> Result<()> {
    let tasks_dir = run_dir.join(TASKS_DIR);
    fs::create_dir_all(&tasks_dir)
        .with_context(|| format!("failed to create run dir '{}'", tasks_dir.display()))?;

    write_json(&run_dir.join(STATUS_FILE), &data.status)?;
    for task in &data.tasks {
        write_json(&tasks_dir.join(format!("{}.json", task.id)), task)?;
    }
    let progress = run_dir.join(PROGRESS_FILE);
    fs::write(&progress, render_progress(data))
        .with_context(|| format!("failed writing progress report '{}'", progress.display()))?;
    debug!(
        run_dir = %run_dir.display(),
        tasks = data.tasks.len(),
        "wrote status snapshot"
    );
    Ok(())
}

pub fn load_status(path: &Path) -> Result<StatusSnapshot> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading status snapshot '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing status snapshot '{}'", path.display()))
}

pub fn load_task_record(path: &Path) -> Result<Task> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading task record '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing task record '{}'", path.display()))
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Queued => "queued",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

pub fn render_progress(data: &SnapshotData) -> String {
    let s = &data.status;
    let mut out = String::new();
    let _ = writeln!(out, "# Swarm progress");
    let _ = writeln!(out);
    let _ = writeln!(out, "Generated: {}", s.generated_at.to_rfc3339());
    let _ = writeln!(
        out,
        "Tasks: {} total, {} running, {} completed, {} failed, {} cancelled",
        s.status.total_tasks,
        s.status.active_tasks,
        s.status.completed_tasks,
        s.status.failed_tasks,
        s.status.cancelled_tasks
    );
    let _ = writeln!(
        out,
        "Agents: {} total, {} busy",
        s.status.total_agents, s.status.active_agents
    );

    for objective in &s.objectives {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {} ({})", objective.description, objective.id);
        let outcome = objective
            .outcome
            .map(|o| format!("{o:?}"))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "Strategy: {} | status: {:?} | outcome: {} | progress: {:.0}%",
            objective.strategy,
            objective.status,
            outcome,
            objective.progress * 100.0
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "| task | status | agent | retries |");
        let _ = writeln!(out, "|---|---|---|---|");
        for task in data.tasks.iter().filter(|t| t.objective_id == objective.id) {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} |",
                task.name,
                status_label(task.status),
                task.assigned_agent.as_deref().unwrap_or("-"),
                task.retry_count
            );
        }
    }
    out
}

struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Writes a snapshot every interval until stopped; stopping writes a final one.
pub struct SnapshotWriter {
    run_dir: PathBuf,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn spawn<F>(run_dir: PathBuf, interval: Duration, collect: F) -> Result<Self>
    where
        F: Fn() -> SnapshotData + Send + 'static,
    {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let dir = run_dir.clone();
        let handle = thread::Builder::new()
            .name("swarm-snapshots".to_string())
            .spawn(move || loop {
                let stopped = {
                    let guard = lock(&thread_signal.stopped);
                    let (guard, _) = match thread_signal
                        .cond
                        .wait_timeout_while(guard, interval, |stopped| !*stopped)
                    {
                        Ok(r) => r,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *guard
                };
                if let Err(err) = write_snapshot(&dir, &collect()) {
                    warn!(error = %err, "status snapshot failed");
                }
                if stopped {
                    break;
                }
            })
            .context("spawn snapshot writer thread")?;
        Ok(Self {
            run_dir,
            signal,
            handle: Some(handle),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn signal_stop(&self) {
        *lock(&self.signal.stopped) = true;
        self.signal.cond.notify_all();
    }

    /// Stop the writer; returns once the final snapshot is on disk.
    pub fn stop(&mut self) -> Result<()> {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("snapshot writer thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::config::FailurePolicy;
    use crate::model::{ObjectiveStatus, Strategy};
    use std::collections::BTreeSet;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{prefix}-{}-{now}", std::process::id()))
    }

    fn sample() -> SnapshotData {
        let objective = Objective {
            id: "objective-1".to_string(),
            description: "build it".to_string(),
            strategy: Strategy::Development,
            required_agent_types: vec!["developer".to_string()],
            min_agents: 1,
            max_agents: 4,
            quality_threshold: 0.0,
            max_duration_ms: 1_000,
            max_retries: 0,
            failure_policy: FailurePolicy::FailFast,
            status: ObjectiveStatus::Executing,
            progress: 0.5,
            outcome: None,
            task_ids: vec!["task-1".to_string()],
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let task = Task {
            id: "task-1".to_string(),
            objective_id: "objective-1".to_string(),
            name: "implement".to_string(),
            task_type: "development".to_string(),
            description: String::new(),
            priority: 1,
            status: TaskStatus::Completed,
            dependencies: BTreeSet::new(),
            required_skills: CapabilitySet::new(),
            resources: Vec::new(),
            assigned_agent: Some("agent-1".to_string()),
            input: serde_json::Value::Null,
            result: Some("done".to_string()),
            error: None,
            started_at: None,
            completed_at: None,
            retry_count: 1,
            timeout_ms: None,
            failed_agents: Vec::new(),
            seq: 0,
        };
        SnapshotData {
            status: StatusSnapshot {
                generated_at: Utc::now(),
                status: SwarmStatus {
                    total_tasks: 1,
                    completed_tasks: 1,
                    ..SwarmStatus::default()
                },
                metrics: SwarmMetrics::default(),
                objectives: vec![objective],
                agents: Vec::new(),
            },
            tasks: vec![task],
        }
    }

    #[test]
    fn snapshot_writes_status_tasks_and_progress() {
        let dir = tmp_dir("swarm-snapshot");
        let data = sample();
        write_snapshot(&dir, &data).expect("write snapshot");

        let status = load_status(&dir.join(STATUS_FILE)).expect("load status");
        assert_eq!(status.status.completed_tasks, 1);
        assert_eq!(status.objectives[0].id, "objective-1");

        let task = load_task_record(&dir.join(TASKS_DIR).join("task-1.json")).expect("task");
        assert_eq!(task.result.as_deref(), Some("done"));

        let progress = fs::read_to_string(dir.join(PROGRESS_FILE)).expect("progress");
        assert!(progress.contains("| implement | completed | agent-1 | 1 |"), "{progress}");
        assert!(progress.contains("progress: 50%"), "{progress}");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn writer_stop_leaves_final_snapshot() {
        let dir = tmp_dir("swarm-snapshot-writer");
        let mut writer =
            SnapshotWriter::spawn(dir.clone(), Duration::from_secs(60), sample).expect("spawn");
        writer.stop().expect("stop");
        assert!(dir.join(STATUS_FILE).exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
