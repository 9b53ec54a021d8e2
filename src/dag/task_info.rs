// src/dag/task_info.rs

//! Per-run task state and the work items handed to the executor.

use std::collections::BTreeSet;

use crate::dag::definition::TaskDefinition;
use crate::engine::TaskName;
use crate::engine::report::TaskStatus;

/// Per-run state of a task (internal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Part of this run, waiting on dependencies.
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Finished (or skipped) with the given terminal status.
    Done(TaskStatus),
}

/// Public, read-only view of a task's per-run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunState {
    /// Not requested in this run.
    NotInRun,
    Pending,
    Running,
    /// Terminal and lets dependents proceed.
    DoneSatisfied,
    /// Terminal and blocks dependents.
    DoneUnsatisfied,
}

impl From<Option<&RunState>> for TaskRunState {
    fn from(state: Option<&RunState>) -> Self {
        match state {
            None => TaskRunState::NotInRun,
            Some(RunState::Pending) => TaskRunState::Pending,
            Some(RunState::Running) => TaskRunState::Running,
            Some(RunState::Done(status)) if status.is_satisfying() => TaskRunState::DoneSatisfied,
            Some(RunState::Done(_)) => TaskRunState::DoneUnsatisfied,
        }
    }
}

/// Static task information plus its per-run state.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: TaskName,
    /// Direct dependencies.
    pub deps: BTreeSet<TaskName>,
    /// `None` if the task is not part of the current run.
    pub run_state: Option<RunState>,
}

impl TaskInfo {
    pub fn from_definition(def: &TaskDefinition) -> Self {
        Self {
            name: def.name.clone(),
            deps: def.depends_on.clone(),
            run_state: None,
        }
    }
}

/// A task the scheduler wants the executor to run now.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub definition: TaskDefinition,
}

impl ScheduledTask {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}
