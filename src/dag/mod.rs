// src/dag/mod.rs

//! DAG representation and scheduling.
//!
//! - [`definition`] holds the static task definitions.
//! - [`graph`] validates definitions into an immutable [`TaskGraph`].
//! - [`scheduler`] contains the per-run state machine that decides
//!   which tasks are ready to run, and which are skipped.
//! - [`task_info`] provides per-run task state and scheduled task types.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] manages per-run state transitions.

pub mod definition;
pub mod graph;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod task_info;

pub use definition::{CommandSpec, FingerprintInput, HealthCheck, TaskDefinition};
pub use graph::TaskGraph;
pub use scheduler::Scheduler;
pub use scheduler_step::SchedulerStep;
pub use task_info::{ScheduledTask, TaskRunState};
