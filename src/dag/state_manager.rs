// src/dag/state_manager.rs

//! Per-run state management for tasks in the scheduler.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::dag::graph::TaskGraph;
use crate::dag::task_info::{RunState, ScheduledTask, TaskInfo};
use crate::engine::TaskName;
use crate::engine::report::{SkipReason, TaskStatus};

/// Manages per-run state transitions for tasks.
pub struct StateManager<'a> {
    graph: &'a TaskGraph,
    tasks: &'a mut BTreeMap<TaskName, TaskInfo>,
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a TaskGraph, tasks: &'a mut BTreeMap<TaskName, TaskInfo>) -> Self {
        Self { graph, tasks }
    }

    /// Include every task of `closure` in this run as `Pending`.
    ///
    /// Tasks already participating keep their current state.
    pub fn mark_pending(&mut self, closure: &BTreeSet<TaskName>) {
        for name in closure {
            match self.tasks.get_mut(name) {
                Some(info) if info.run_state.is_none() => {
                    info.run_state = Some(RunState::Pending);
                    debug!(task = %info.name, "marked Pending for this run");
                }
                Some(_) => {}
                None => warn!(task = %name, "requested task not present in tasks map"),
            }
        }
    }

    /// Whether every dependency of `info` is terminal and satisfying.
    pub fn deps_satisfied_for_info(&self, info: &TaskInfo) -> bool {
        ReadOnlyStateManager::new(self.tasks).deps_satisfied_for_info(info)
    }

    /// Resolve every `Pending` task downstream of `root` as skipped with
    /// `reason`.
    ///
    /// Running or finished dependents are left alone; the root itself is
    /// not included in the result.
    pub fn mark_dependents_skipped(
        &mut self,
        root: &str,
        reason: &SkipReason,
    ) -> Vec<(TaskName, SkipReason)> {
        let mut stack: Vec<TaskName> = self
            .graph
            .dependents_of(root)
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut newly_skipped = Vec::new();

        while let Some(name) = stack.pop() {
            let Some(info) = self.tasks.get_mut(&name) else {
                continue;
            };
            if matches!(info.run_state, Some(RunState::Pending)) {
                info.run_state = Some(RunState::Done(TaskStatus::Skipped(reason.clone())));
                debug!(task = %info.name, reason = %reason, "skipping dependent");
                newly_skipped.push((info.name.clone(), reason.clone()));
                stack.extend(self.graph.dependents_of(&name).into_iter().map(str::to_string));
            }
        }

        newly_skipped
    }

    /// Resolve every `Pending` task as skipped with `reason`.
    pub fn mark_all_pending_skipped(&mut self, reason: &SkipReason) -> Vec<(TaskName, SkipReason)> {
        let mut newly_skipped = Vec::new();
        for info in self.tasks.values_mut() {
            if matches!(info.run_state, Some(RunState::Pending)) {
                info.run_state = Some(RunState::Done(TaskStatus::Skipped(reason.clone())));
                newly_skipped.push((info.name.clone(), reason.clone()));
            }
        }
        newly_skipped
    }

    /// Collect tasks that are `Pending` and whose dependencies are
    /// satisfied, mark them as `Running`, and return them as
    /// `ScheduledTask`s.
    pub fn collect_new_ready_tasks(&mut self) -> Vec<ScheduledTask> {
        // Decide first, then mutate to avoid borrowing issues.
        let candidates: Vec<TaskName> = self
            .tasks
            .values()
            .filter(|info| {
                matches!(info.run_state, Some(RunState::Pending))
                    && self.deps_satisfied_for_info(info)
            })
            .map(|info| info.name.clone())
            .collect();

        let graph = self.graph;
        let mut ready = Vec::new();
        for name in candidates {
            let Some(definition) = graph.get(&name) else {
                warn!(task = %name, "scheduled task missing from graph");
                continue;
            };
            if let Some(info) = self.tasks.get_mut(&name) {
                info!(task = %info.name, "dependencies satisfied; scheduling task");
                info.run_state = Some(RunState::Running);
                ready.push(ScheduledTask {
                    definition: definition.clone(),
                });
            }
        }

        ready
    }

    /// Check if all tasks in the run are in a terminal state.
    pub fn all_tasks_terminal(&self) -> bool {
        !self.tasks.values().any(|info| {
            matches!(
                info.run_state,
                Some(RunState::Pending) | Some(RunState::Running)
            )
        })
    }
}

/// A read-only view of the state manager for checking dependency
/// satisfaction.
pub struct ReadOnlyStateManager<'a> {
    tasks: &'a BTreeMap<TaskName, TaskInfo>,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(tasks: &'a BTreeMap<TaskName, TaskInfo>) -> Self {
        Self { tasks }
    }

    pub fn deps_satisfied_for_info(&self, info: &TaskInfo) -> bool {
        info.deps.iter().all(|dep_name| match self.tasks.get(dep_name) {
            Some(dep) => match &dep.run_state {
                Some(RunState::Done(status)) => status.is_satisfying(),
                // Still waiting, or (for a closure-built run, impossibly)
                // not part of this run.
                Some(RunState::Pending) | Some(RunState::Running) | None => false,
            },
            None => {
                warn!(
                    task = %info.name,
                    dep = %dep_name,
                    "dependency missing from tasks map"
                );
                false
            }
        })
    }
}
