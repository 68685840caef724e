//! One worker thread per agent. A worker runs dispatched attempts strictly one
//! at a time and reports each result back to the scheduling loop.

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::error::{SwarmError, SwarmResult};
use crate::executor::{ExecutionFailure, ExecutionOptions, ExecutionOutput, TaskExecutor, TaskHandler};
use crate::model::{AgentId, Task};

pub struct Dispatch {
    pub task: Task,
    pub handler: Arc<dyn TaskHandler>,
    pub options: ExecutionOptions,
}

#[derive(Debug)]
pub struct Completion {
    pub agent_id: AgentId,
    pub task_id: String,
    pub result: Result<ExecutionOutput, ExecutionFailure>,
}

/// Messages consumed by the scheduling loop.
pub enum LoopMessage {
    Finished(Completion),
    Wake,
    Shutdown,
}

pub struct AgentWorker {
    agent_id: AgentId,
    tx: Option<Sender<Dispatch>>,
    handle: Option<JoinHandle<()>>,
}

impl AgentWorker {
    pub fn spawn(
        agent_id: AgentId,
        executor: Arc<TaskExecutor>,
        results: Sender<LoopMessage>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Dispatch>();
        let id = agent_id.clone();
        let handle = thread::Builder::new()
            .name(format!("agent-{agent_id}"))
            .spawn(move || {
                for job in rx {
                    let task_id = job.task.id.clone();
                    debug!(agent = %id, task = %task_id, "agent picked up task");
                    let result = executor.run(&job.task, job.handler, job.options);
                    let done = Completion {
                        agent_id: id.clone(),
                        task_id,
                        result,
                    };
                    if results.send(LoopMessage::Finished(done)).is_err() {
                        break;
                    }
                }
                debug!(agent = %id, "agent worker stopped");
            })
            .with_context(|| format!("spawn worker thread for agent '{agent_id}'"))?;
        Ok(Self {
            agent_id,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn dispatch(&self, job: Dispatch) -> SwarmResult<()> {
        let tx = self.tx.as_ref().ok_or(SwarmError::ShuttingDown)?;
        tx.send(job).map_err(|_| SwarmError::ShuttingDown)
    }

    /// Close the queue and wait for the in-flight attempt, if any.
    pub fn stop(&mut self) -> Result<()> {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(agent = %self.agent_id, "agent worker panicked");
                return Err(anyhow!("agent worker '{}' panicked", self.agent_id));
            }
        }
        Ok(())
    }
}

impl Drop for AgentWorker {
    fn drop(&mut self) {
        // Closing the queue lets the thread exit on its own.
        self.tx.take();
    }
}
