// src/dag/scheduler.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dag::graph::TaskGraph;
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::StateManager;
use crate::dag::task_info::{RunState, TaskInfo, TaskRunState};
use crate::engine::TaskName;
use crate::engine::report::{SkipReason, TaskStatus};

/// Scheduler holds the immutable graph plus mutable per-run state.
///
/// It is a pure state machine: no IO, no clocks, no async. It is
/// responsible for:
/// - remembering which tasks are part of the current run
/// - deciding when a task is ready (all dependencies terminal and satisfying)
/// - resolving the dependents of a failed task as skipped
/// - resolving everything still pending on cancellation
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<TaskGraph>,
    tasks: BTreeMap<TaskName, TaskInfo>,
    active: bool,
}

impl Scheduler {
    pub fn new(graph: Arc<TaskGraph>) -> Self {
        let tasks = graph
            .definitions()
            .map(|def| (def.name.clone(), TaskInfo::from_definition(def)))
            .collect();

        Self {
            graph,
            tasks,
            active: false,
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Returns `true` if there is currently no active run.
    pub fn is_idle(&self) -> bool {
        !self.active
    }

    /// Read-only view of the given task's run state.
    pub fn run_state_of(&self, task: &str) -> Option<TaskRunState> {
        let info = self.tasks.get(task)?;
        Some(info.run_state.as_ref().into())
    }

    /// Terminal status of a task in this run, if it has one.
    pub fn status_of(&self, task: &str) -> Option<&TaskStatus> {
        match self.tasks.get(task)?.run_state.as_ref()? {
            RunState::Done(status) => Some(status),
            _ => None,
        }
    }

    /// Names of tasks participating in the current run.
    pub fn tasks_in_current_run(&self) -> Vec<TaskName> {
        self.tasks
            .values()
            .filter(|info| info.run_state.is_some())
            .map(|info| info.name.clone())
            .collect()
    }

    /// Start a run for `requested` plus everything it transitively depends
    /// on. An empty request means every task.
    ///
    /// Unknown names are ignored here; callers validate them up front.
    pub fn start_run(&mut self, requested: &[TaskName]) -> SchedulerStep {
        for info in self.tasks.values_mut() {
            info.run_state = None;
        }
        self.active = true;

        let closure: BTreeSet<TaskName> = if requested.is_empty() {
            self.graph.tasks().map(str::to_string).collect()
        } else {
            self.graph.closure(requested.iter().map(String::as_str))
        };
        info!(tasks = closure.len(), "scheduler: starting run");

        let mut manager = StateManager::new(&self.graph, &mut self.tasks);
        manager.mark_pending(&closure);
        let newly_scheduled = manager.collect_new_ready_tasks();
        let run_just_finished = self.maybe_finish_run();

        SchedulerStep {
            newly_scheduled,
            newly_skipped: Vec::new(),
            run_just_finished,
        }
    }

    /// Record the terminal `status` of a running task.
    ///
    /// A satisfying status may unblock dependents. Any other status resolves
    /// every pending dependent as skipped.
    pub fn complete(&mut self, task: &str, status: TaskStatus) -> SchedulerStep {
        if !self.active {
            warn!(task = %task, "completion with no active run; ignoring");
            return SchedulerStep::default();
        }
        if !status.is_terminal() {
            warn!(task = %task, status = %status, "non-terminal completion; ignoring");
            return SchedulerStep::default();
        }

        let Some(info) = self.tasks.get_mut(task) else {
            warn!(task = %task, "completion for unknown task; ignoring");
            return SchedulerStep::default();
        };
        if !matches!(info.run_state, Some(RunState::Running)) {
            warn!(task = %task, "completion for a task that is not running; ignoring");
            return SchedulerStep::default();
        }

        debug!(task = %task, status = %status, "task finished");
        let propagate = propagated_skip(task, &status);
        info.run_state = Some(RunState::Done(status));

        let mut manager = StateManager::new(&self.graph, &mut self.tasks);
        let (newly_scheduled, newly_skipped) = match propagate {
            None => (manager.collect_new_ready_tasks(), Vec::new()),
            Some(reason) => {
                let skipped = manager.mark_dependents_skipped(task, &reason);
                if !skipped.is_empty() {
                    warn!(task = %task, skipped = skipped.len(), "skipping dependents");
                }
                (Vec::new(), skipped)
            }
        };
        let run_just_finished = self.maybe_finish_run();

        SchedulerStep {
            newly_scheduled,
            newly_skipped,
            run_just_finished,
        }
    }

    /// Resolve every pending task as `Skipped(Cancelled)`.
    ///
    /// Running tasks are untouched; their workers report back as usual.
    pub fn cancel(&mut self) -> SchedulerStep {
        if !self.active {
            return SchedulerStep::default();
        }
        let mut manager = StateManager::new(&self.graph, &mut self.tasks);
        let newly_skipped = manager.mark_all_pending_skipped(&SkipReason::Cancelled);
        info!(skipped = newly_skipped.len(), "scheduler: run cancelled");
        let run_just_finished = self.maybe_finish_run();

        SchedulerStep {
            newly_scheduled: Vec::new(),
            newly_skipped,
            run_just_finished,
        }
    }

    /// Clear the active flag once every task is terminal.
    ///
    /// Returns `true` if this call transitioned the scheduler to idle.
    fn maybe_finish_run(&mut self) -> bool {
        if !self.active {
            return false;
        }
        let manager = StateManager::new(&self.graph, &mut self.tasks);
        if manager.all_tasks_terminal() {
            info!("scheduler: all tasks terminal; run finished");
            self.active = false;
            true
        } else {
            false
        }
    }
}

/// How a non-satisfying status spreads to pending dependents.
fn propagated_skip(task: &str, status: &TaskStatus) -> Option<SkipReason> {
    match status {
        s if s.is_satisfying() => None,
        TaskStatus::Skipped(SkipReason::UpstreamFailed { upstream }) => {
            Some(SkipReason::UpstreamFailed {
                upstream: upstream.clone(),
            })
        }
        TaskStatus::Skipped(SkipReason::Cancelled) => Some(SkipReason::Cancelled),
        _ => Some(SkipReason::UpstreamFailed {
            upstream: task.to_string(),
        }),
    }
}
