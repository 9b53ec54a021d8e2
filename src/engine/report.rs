// src/engine/report.rs

//! Per-task results of one invocation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;

use crate::dag::definition::TaskDefinition;
use crate::engine::TaskName;
use crate::exec::ProcessHandle;
use crate::types::TaskKind;

/// Why a task ended up `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("exited with code {0}")]
    Exited(i32),

    #[error("unhealthy after {attempts} attempt(s)")]
    Unhealthy { attempts: u32 },

    #[error("fingerprint failed: {0}")]
    Fingerprint(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("supervisor error: {0}")]
    Supervisor(String),
}

/// Why a task ended up `Skipped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Inputs unchanged and (for persistent tasks) the instance is live.
    AlreadySatisfied,
    /// A dependency failed, directly or transitively.
    UpstreamFailed { upstream: TaskName },
    Cancelled,
    /// Running but unhealthy, and the restart policy says to leave it.
    LeftDegraded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadySatisfied => write!(f, "already satisfied"),
            SkipReason::UpstreamFailed { upstream } => write!(f, "upstream '{upstream}' failed"),
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::LeftDegraded => write!(f, "left degraded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed(TaskFailure),
    Skipped(SkipReason),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Whether dependents may proceed once this task is in this state.
    pub fn is_satisfying(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Skipped(SkipReason::AlreadySatisfied)
                | TaskStatus::Skipped(SkipReason::LeftDegraded)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed(_))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed(failure) => write!(f, "failed ({failure})"),
            TaskStatus::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

/// One attempt to satisfy a task in the current invocation.
///
/// Owned by its worker while the task runs; only the terminal state is
/// published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub task_name: TaskName,
    pub kind: TaskKind,
    pub fingerprint: Option<String>,
    pub status: TaskStatus,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    /// Persistent tasks only.
    pub handle: Option<ProcessHandle>,
    /// Process starts made for this task (0 if it never ran).
    pub attempts: u32,
    pub output: Option<PathBuf>,
}

impl TaskRun {
    pub fn new(def: &TaskDefinition) -> Self {
        Self {
            task_name: def.name.clone(),
            kind: def.kind,
            fingerprint: None,
            status: TaskStatus::Pending,
            started_at: SystemTime::now(),
            ended_at: None,
            handle: None,
            attempts: 0,
            output: None,
        }
    }

    /// A run that was decided without ever being dispatched.
    pub fn skipped(def: &TaskDefinition, reason: SkipReason) -> Self {
        let mut run = Self::new(def);
        run.finish(TaskStatus::Skipped(reason));
        run
    }

    pub fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.ended_at = Some(SystemTime::now());
    }
}

/// Outcome of a whole invocation, keyed by task name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub runs: BTreeMap<TaskName, TaskRun>,
}

impl RunReport {
    pub fn get(&self, task: &str) -> Option<&TaskRun> {
        self.runs.get(task)
    }

    pub fn status_of(&self, task: &str) -> Option<&TaskStatus> {
        self.runs.get(task).map(|run| &run.status)
    }

    pub fn failed(&self) -> Vec<(&str, &TaskFailure)> {
        self.runs
            .iter()
            .filter_map(|(name, run)| match &run.status {
                TaskStatus::Failed(failure) => Some((name.as_str(), failure)),
                _ => None,
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }

    /// One line for humans, e.g.
    /// `2 tasks failed: migrate (exited with code 1), seed (spawn failed: ...)`.
    pub fn summary(&self) -> String {
        let failed = self.failed();
        if failed.is_empty() {
            let total = self.runs.len();
            return format!("{total} {} ok", plural(total));
        }

        let details = failed
            .iter()
            .map(|(name, failure)| format!("{name} ({failure})"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} {} failed: {details}", failed.len(), plural(failed.len()))
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "task" } else { "tasks" }
}
