use std::sync::Arc;

use overrun::dag::{Scheduler, TaskGraph, TaskRunState};
use overrun::engine::{SkipReason, TaskFailure, TaskStatus};
use overrun_test_utils::builders::{persistent, transient};
use overrun_test_utils::init_tracing;

/// db -> migrate -> api, plus an unrelated `lint`.
fn stack() -> Scheduler {
    let graph = TaskGraph::build(vec![
        persistent("db", &[]),
        transient("migrate", &["db"]),
        persistent("api", &["migrate"]),
        transient("lint", &[]),
    ])
    .unwrap();
    Scheduler::new(Arc::new(graph))
}

fn names(list: Vec<&str>) -> Vec<String> {
    list.into_iter().map(str::to_string).collect()
}

#[test]
fn dispatches_in_dependency_order() {
    init_tracing();
    let mut s = stack();

    let step = s.start_run(&[]);
    assert_eq!(step.scheduled_names(), vec!["db", "lint"]);
    assert!(!step.run_just_finished);
    assert_eq!(s.run_state_of("migrate"), Some(TaskRunState::Pending));
    assert_eq!(s.run_state_of("db"), Some(TaskRunState::Running));

    let step = s.complete("db", TaskStatus::Succeeded);
    assert_eq!(step.scheduled_names(), vec!["migrate"]);

    let step = s.complete("lint", TaskStatus::Skipped(SkipReason::AlreadySatisfied));
    assert!(step.newly_scheduled.is_empty());

    let step = s.complete("migrate", TaskStatus::Succeeded);
    assert_eq!(step.scheduled_names(), vec!["api"]);

    let step = s.complete("api", TaskStatus::Succeeded);
    assert!(step.run_just_finished);
    assert!(s.is_idle());
    assert_eq!(s.run_state_of("api"), Some(TaskRunState::DoneSatisfied));
}

#[test]
fn request_pulls_in_dependencies_only() {
    let mut s = stack();

    let step = s.start_run(&names(vec!["migrate"]));
    assert_eq!(step.scheduled_names(), vec!["db"]);

    let mut in_run = s.tasks_in_current_run();
    in_run.sort();
    assert_eq!(in_run, names(vec!["db", "migrate"]));
    assert_eq!(s.run_state_of("api"), Some(TaskRunState::NotInRun));
    assert_eq!(s.run_state_of("lint"), Some(TaskRunState::NotInRun));
}

#[test]
fn failure_skips_transitive_dependents_and_spares_siblings() {
    let mut s = stack();
    s.start_run(&[]);

    let step = s.complete("db", TaskStatus::Failed(TaskFailure::Exited(1)));
    let upstream = SkipReason::UpstreamFailed {
        upstream: "db".to_string(),
    };
    let mut skipped = step.newly_skipped.clone();
    skipped.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        skipped,
        vec![
            ("api".to_string(), upstream.clone()),
            ("migrate".to_string(), upstream.clone()),
        ]
    );
    assert!(step.newly_scheduled.is_empty());
    assert!(!step.run_just_finished, "lint is still running");
    assert_eq!(s.status_of("api"), Some(&TaskStatus::Skipped(upstream)));

    let step = s.complete("lint", TaskStatus::Succeeded);
    assert!(step.run_just_finished);
    assert_eq!(s.run_state_of("db"), Some(TaskRunState::DoneUnsatisfied));
}

#[test]
fn left_degraded_still_unblocks_dependents() {
    let mut s = stack();
    s.start_run(&names(vec!["migrate"]));

    let step = s.complete("db", TaskStatus::Skipped(SkipReason::LeftDegraded));
    assert_eq!(step.scheduled_names(), vec!["migrate"]);
}

#[test]
fn cancel_resolves_pending_but_not_running() {
    let mut s = stack();
    s.start_run(&[]);

    let step = s.cancel();
    let mut skipped: Vec<_> = step.newly_skipped.into_iter().map(|(n, _)| n).collect();
    skipped.sort();
    assert_eq!(skipped, names(vec!["api", "migrate"]));
    assert!(!step.run_just_finished);
    assert_eq!(s.run_state_of("db"), Some(TaskRunState::Running));

    s.complete("db", TaskStatus::Succeeded);
    let step = s.complete("lint", TaskStatus::Skipped(SkipReason::Cancelled));
    assert!(step.run_just_finished);
    assert!(step.newly_scheduled.is_empty(), "nothing is dispatched after cancel");
}

#[test]
fn stray_completions_are_ignored() {
    let mut s = stack();

    // No active run.
    let step = s.complete("db", TaskStatus::Succeeded);
    assert!(step.newly_scheduled.is_empty());

    s.start_run(&[]);
    // Not running yet.
    let step = s.complete("migrate", TaskStatus::Succeeded);
    assert!(step.newly_scheduled.is_empty());
    assert_eq!(s.run_state_of("migrate"), Some(TaskRunState::Pending));

    // Non-terminal status.
    let step = s.complete("db", TaskStatus::Running);
    assert!(step.newly_scheduled.is_empty());
    assert_eq!(s.run_state_of("db"), Some(TaskRunState::Running));

    // Unknown task.
    let step = s.complete("nope", TaskStatus::Succeeded);
    assert!(step.newly_scheduled.is_empty());
}

#[test]
fn empty_graph_finishes_immediately() {
    let mut s = Scheduler::new(Arc::new(TaskGraph::build(Vec::new()).unwrap()));
    let step = s.start_run(&[]);
    assert!(step.newly_scheduled.is_empty());
    assert!(step.run_just_finished);
    assert!(s.is_idle());
}
