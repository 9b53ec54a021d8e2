// src/reconcile.rs

//! Bringing persisted belief in line with what the OS actually runs.
//!
//! Runs once at the start of every invocation (and from `status`), before
//! the scheduler looks at any record.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dag::graph::TaskGraph;
use crate::engine::TaskName;
use crate::errors::StoreError;
use crate::exec::{HealthStatus, ProcessSupervisor};
use crate::state::{PersistedRecord, RecordStatus, StateStore};
use crate::types::RestartPolicy;

/// What the reconciler concluded about one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Alive and healthy (or not checkable).
    Live,
    /// Dead; the record was removed. `restart_flagged` is set when the
    /// task's policy asks for an unconditional restart.
    Orphaned { restart_flagged: bool },
    /// Alive but failing its health check; the record now says so.
    Degraded,
    /// Alive, but the task is no longer defined as persistent. Left alone.
    Undefined,
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOutcome::Live => write!(f, "live"),
            ReconcileOutcome::Orphaned { .. } => write!(f, "orphaned"),
            ReconcileOutcome::Degraded => write!(f, "degraded"),
            ReconcileOutcome::Undefined => write!(f, "undefined"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcomes: BTreeMap<TaskName, ReconcileOutcome>,
}

impl ReconcileReport {
    pub fn get(&self, task: &str) -> Option<ReconcileOutcome> {
        self.outcomes.get(task).copied()
    }

    pub fn orphaned(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ReconcileOutcome::Orphaned { .. }))
            .map(|(name, _)| name.as_str())
    }

    pub fn degraded(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ReconcileOutcome::Degraded))
            .map(|(name, _)| name.as_str())
    }
}

/// Walk every stored record and classify it against live OS state.
///
/// Dead records are removed, unhealthy ones are marked degraded. A failed
/// write is logged and leaves that record as it was; only a failed `load`
/// aborts reconciliation.
pub async fn reconcile(
    graph: &TaskGraph,
    store: &dyn StateStore,
    supervisor: &dyn ProcessSupervisor,
    probe_timeout: Duration,
) -> Result<ReconcileReport, StoreError> {
    let records = store.load()?;
    let mut report = ReconcileReport::default();

    for (task, record) in records {
        let outcome = reconcile_one(graph, store, supervisor, probe_timeout, &task, record).await;
        debug!(task = %task, outcome = %outcome, "reconciled record");
        report.outcomes.insert(task, outcome);
    }

    info!(
        records = report.outcomes.len(),
        orphaned = report.orphaned().count(),
        degraded = report.degraded().count(),
        "reconciliation finished"
    );
    Ok(report)
}

async fn reconcile_one(
    graph: &TaskGraph,
    store: &dyn StateStore,
    supervisor: &dyn ProcessSupervisor,
    probe_timeout: Duration,
    task: &str,
    record: PersistedRecord,
) -> ReconcileOutcome {
    let alive = supervisor.is_alive(&record.handle).await;
    let definition = graph.get(task).filter(|def| def.is_persistent());

    let Some(def) = definition else {
        if alive {
            warn!(task = %task, pid = record.handle.pid, "process for undefined task is still running");
            return ReconcileOutcome::Undefined;
        }
        info!(task = %task, "removing record of undefined task");
        remove_record(store, task);
        return ReconcileOutcome::Orphaned {
            restart_flagged: false,
        };
    };

    if !alive {
        info!(task = %task, pid = record.handle.pid, "recorded process is gone");
        remove_record(store, task);
        return ReconcileOutcome::Orphaned {
            restart_flagged: def.restart_policy == RestartPolicy::Always,
        };
    }

    let health = match &def.health_check {
        Some(check) => {
            supervisor
                .poll_health(&record.handle, check, probe_timeout)
                .await
        }
        None => HealthStatus::Unknown,
    };

    let (outcome, status) = match health {
        HealthStatus::Unhealthy => (ReconcileOutcome::Degraded, RecordStatus::Degraded),
        HealthStatus::Healthy => (ReconcileOutcome::Live, RecordStatus::Running),
        // Nothing new learned; keep whatever we believed before.
        HealthStatus::Unknown if record.last_known_status == RecordStatus::Degraded => {
            (ReconcileOutcome::Degraded, RecordStatus::Degraded)
        }
        HealthStatus::Unknown => (ReconcileOutcome::Live, record.last_known_status),
    };

    if status != record.last_known_status {
        if status == RecordStatus::Degraded {
            warn!(task = %task, pid = record.handle.pid, "running task failed its health check");
        }
        if let Err(e) = store.put(task, &record.clone().with_status(status)) {
            warn!(task = %task, error = %e, "failed to update record status");
        }
    }

    outcome
}

fn remove_record(store: &dyn StateStore, task: &str) {
    if let Err(e) = store.remove(task) {
        warn!(task = %task, error = %e, "failed to remove stale record");
    }
}
