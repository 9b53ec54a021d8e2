// src/engine/mod.rs

//! Orchestration engine for overrun.
//!
//! This module ties together:
//! - the pure DAG [`crate::dag::Scheduler`]
//! - per-task workers that fingerprint, start, health-check and retry
//! - the runtime event loop reacting to worker completions and
//!   cancellation
//! - the [`Environment`] facade used by the CLI
//!
//! The pure state machine lives in `dag`; the async/IO shell is
//! implemented in [`runtime`] and [`worker`].

use std::time::Duration;

/// Canonical task name type used throughout the engine.
pub type TaskName = String;

pub mod environment;
pub mod report;
pub mod retry;
pub mod runtime;
pub mod worker;

pub use environment::Environment;
pub use report::{RunReport, SkipReason, TaskFailure, TaskRun, TaskStatus};
pub use retry::RetryPolicy;
pub use runtime::Runtime;

/// Longest a single health probe may take, however long the overall
/// readiness window is.
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs for the executor, usually filled from `[config]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum number of in-flight workers.
    pub concurrency: usize,
    /// SIGTERM-to-SIGKILL grace period.
    pub grace_timeout: Duration,
    /// Gap between health polls (and the settle time without a check).
    pub health_interval: Duration,
    /// How long a persistent task may take to become healthy.
    pub health_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            grace_timeout: Duration::from_secs(5),
            health_interval: Duration::from_millis(500),
            health_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorOptions {
    pub fn probe_timeout(&self) -> Duration {
        self.health_timeout.min(MAX_PROBE_TIMEOUT)
    }
}

/// Events flowing into the runtime from workers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A worker reached a terminal state for its task.
    TaskFinished { run: TaskRun },
}
