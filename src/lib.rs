//! `swarm` coordination and distributed execution engine.
//!
//! A coordinator (`coordinator`) decomposes objectives into dependency-ordered
//! task graphs (`decompose`), assigns ready tasks to registered agents
//! (`scheduler`, `worker`) and runs each attempt in a supervised sandbox
//! (`executor`, `command`). Task results land in a replicated TTL store
//! (`memory`); tasks coordinate through resource locks and acknowledged
//! messages (`coordination`).
//!
//! Invariants:
//! - a task is queued only once every dependency has completed
//! - an agent runs at most one task at a time
//! - a task is attempted at most `max_retries + 1` times
//! - granting a lock never closes a wait-for cycle

pub mod capability;
pub mod command;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod decompose;
pub mod error;
pub mod events;
pub mod executor;
pub mod memory;
pub mod model;
pub mod scheduler;
pub mod snapshot;
mod sync;
pub mod worker;

pub use capability::CapabilitySet;
pub use config::SwarmConfig;
pub use coordinator::SwarmCoordinator;
pub use error::{SwarmError, SwarmResult};
pub use events::SwarmEvent;
pub use executor::{ExecutionContext, TaskExecutor, TaskHandler};
pub use memory::MemoryStore;
pub use model::{
    AgentCapabilities, ObjectiveOutcome, ObjectiveRequirements, Task, TaskSpec, TaskStatus,
};
