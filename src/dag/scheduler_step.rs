// src/dag/scheduler_step.rs

//! Step-by-step execution result types for the scheduler.

use crate::dag::task_info::ScheduledTask;
use crate::engine::TaskName;
use crate::engine::report::SkipReason;

/// Structured result of a single scheduler "step".
///
/// The runtime dispatches `newly_scheduled` and records `newly_skipped`
/// directly; tests step the scheduler by hand and assert on both.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Tasks whose dependencies just became satisfied.
    pub newly_scheduled: Vec<ScheduledTask>,
    /// Pending tasks that were resolved without running (upstream failure
    /// or cancellation).
    pub newly_skipped: Vec<(TaskName, SkipReason)>,
    /// Whether this step left every task of the run terminal.
    pub run_just_finished: bool,
}

impl SchedulerStep {
    pub fn scheduled_names(&self) -> Vec<&str> {
        self.newly_scheduled.iter().map(|t| t.name()).collect()
    }
}
