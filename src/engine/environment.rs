// src/engine/environment.rs

//! The facade the CLI (and tests) talk to.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::report::RunReport;
use super::runtime::Runtime;
use super::worker::WorkerContext;
use super::{ExecutorOptions, TaskName};
use crate::dag::{Scheduler, TaskGraph};
use crate::errors::{OverrunError, Result};
use crate::exec::{ProcessSupervisor, StopResult};
use crate::fingerprint::Fingerprinter;
use crate::reconcile::{ReconcileReport, reconcile};
use crate::state::{MemoryMemo, PersistedRecord, StateStore, TransientMemo};

/// A validated task graph bound to its state store and process supervisor.
///
/// Nothing here is global: two environments over two stores never see each
/// other, and tests build one per case with fakes.
pub struct Environment {
    graph: Arc<TaskGraph>,
    store: Arc<dyn StateStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    fingerprinter: Arc<Fingerprinter>,
    memo: Arc<dyn TransientMemo>,
    options: ExecutorOptions,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("tasks", &self.graph.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Environment with default options, an in-memory transient memo and
    /// fingerprints resolved against the current directory.
    pub fn new(
        graph: TaskGraph,
        store: Arc<dyn StateStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            store,
            supervisor,
            fingerprinter: Arc::new(Fingerprinter::new(".")),
            memo: Arc::new(MemoryMemo::new()),
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Fingerprinter) -> Self {
        self.fingerprinter = Arc::new(fingerprinter);
        self
    }

    pub fn with_memo(mut self, memo: Arc<dyn TransientMemo>) -> Self {
        self.memo = memo;
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Bring `requested` (all tasks if empty) and their dependencies up to
    /// date.
    pub async fn run(&self, requested: &[TaskName]) -> Result<RunReport> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_with_cancel(requested, cancel_rx).await
    }

    /// Like [`Environment::run`], stopping early once `cancel` turns true.
    pub async fn run_with_cancel(
        &self,
        requested: &[TaskName],
        cancel: watch::Receiver<bool>,
    ) -> Result<RunReport> {
        if let Some(unknown) = requested.iter().find(|name| !self.graph.contains(name)) {
            return Err(OverrunError::TaskNotFound(unknown.clone()));
        }

        self.reconcile().await?;

        let defined: Vec<&str> = self.graph.tasks().collect();
        if let Err(e) = self.memo.prune(&defined) {
            warn!(error = %e, "failed to prune transient memo");
        }

        let ctx = WorkerContext {
            store: Arc::clone(&self.store),
            supervisor: Arc::clone(&self.supervisor),
            fingerprinter: Arc::clone(&self.fingerprinter),
            memo: Arc::clone(&self.memo),
            options: self.options,
            cancel,
        };
        let scheduler = Scheduler::new(Arc::clone(&self.graph));
        let report = Runtime::new(scheduler, ctx).run(requested).await;
        Ok(report)
    }

    /// Reconcile stored records against the OS.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let report = reconcile(
            &self.graph,
            self.store.as_ref(),
            self.supervisor.as_ref(),
            self.options.probe_timeout(),
        )
        .await?;
        Ok(report)
    }

    /// Current record of every defined persistent task (`None` when not
    /// running), after reconciliation.
    pub async fn status(&self) -> Result<BTreeMap<TaskName, Option<PersistedRecord>>> {
        self.reconcile().await?;
        let mut records = self.store.load()?;

        Ok(self
            .graph
            .definitions()
            .filter(|def| def.is_persistent())
            .map(|def| (def.name.clone(), records.remove(&def.name)))
            .collect())
    }

    /// Stop a persistent task and forget its record.
    pub async fn stop(&self, task: &str) -> Result<StopResult> {
        let def = self
            .graph
            .get(task)
            .ok_or_else(|| OverrunError::TaskNotFound(task.to_string()))?;
        if !def.is_persistent() {
            return Err(OverrunError::NotPersistent(task.to_string()));
        }

        let Some(record) = self.store.get(task)? else {
            info!(task = %task, "no record; nothing to stop");
            return Ok(StopResult::AlreadyExited);
        };

        let result = self
            .supervisor
            .stop(&record.handle, self.options.grace_timeout)
            .await?;
        self.store.remove(task)?;
        info!(task = %task, pid = record.handle.pid, result = ?result, "stopped task");
        Ok(result)
    }
}
