// src/engine/worker.rs

//! Per-task workers.
//!
//! A worker owns the [`TaskRun`] of its task from dispatch until it reaches
//! a terminal state. It never touches the scheduler; it only reports the
//! finished run back to the runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use super::ExecutorOptions;
use super::report::{SkipReason, TaskFailure, TaskRun, TaskStatus};
use crate::dag::definition::TaskDefinition;
use crate::exec::{HealthStatus, ProcessHandle, ProcessSupervisor, StartMode};
use crate::fingerprint::Fingerprinter;
use crate::state::{PersistedRecord, RecordStatus, StateStore, TransientMemo};
use crate::types::TaskKind;

/// Everything a worker needs, shared by all workers of one run.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn StateStore>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub fingerprinter: Arc<Fingerprinter>,
    pub memo: Arc<dyn TransientMemo>,
    pub options: ExecutorOptions,
    pub cancel: watch::Receiver<bool>,
}

/// Resolves once cancellation is requested. Never resolves if the sender is
/// gone without having cancelled.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drive one task to a terminal state.
pub async fn run_task(ctx: WorkerContext, def: TaskDefinition) -> TaskRun {
    let mut run = TaskRun::new(&def);
    run.status = TaskStatus::Running;

    let status = match compute_fingerprint(&ctx, &def).await {
        Ok(fingerprint) => {
            run.fingerprint = Some(fingerprint.clone());
            match def.kind {
                TaskKind::Transient => run_transient(&ctx, &def, &fingerprint, &mut run).await,
                TaskKind::Persistent => run_persistent(&ctx, &def, &fingerprint, &mut run).await,
            }
        }
        Err(e) => {
            error!(task = %def.name, error = %e, "failed to compute fingerprint");
            TaskStatus::Failed(TaskFailure::Fingerprint(format!("{e:#}")))
        }
    };

    info!(task = %def.name, status = %status, attempts = run.attempts, "task finished");
    run.finish(status);
    run
}

async fn compute_fingerprint(ctx: &WorkerContext, def: &TaskDefinition) -> anyhow::Result<String> {
    let fingerprinter = Arc::clone(&ctx.fingerprinter);
    let def = def.clone();
    tokio::task::spawn_blocking(move || fingerprinter.fingerprint(&def)).await?
}

async fn run_transient(
    ctx: &WorkerContext,
    def: &TaskDefinition,
    fingerprint: &str,
    run: &mut TaskRun,
) -> TaskStatus {
    match ctx.memo.load(&def.name) {
        Ok(Some(previous)) if previous == fingerprint => {
            debug!(task = %def.name, "inputs unchanged since last success");
            return TaskStatus::Skipped(SkipReason::AlreadySatisfied);
        }
        Ok(_) => {}
        Err(e) => warn!(task = %def.name, error = %e, "failed to read transient memo"),
    }

    let mut cancel = ctx.cancel.clone();
    if *cancel.borrow() {
        return TaskStatus::Skipped(SkipReason::Cancelled);
    }

    let handle = match ctx
        .supervisor
        .start(&def.name, &def.command, StartMode::Attached)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            error!(task = %def.name, error = %e, "failed to start task");
            return TaskStatus::Failed(TaskFailure::Spawn(e.to_string()));
        }
    };
    run.attempts = 1;
    run.output = handle.output.clone();

    let waited = tokio::select! {
        waited = ctx.supervisor.wait(&handle) => waited,
        _ = cancelled(&mut cancel) => {
            info!(task = %def.name, pid = handle.pid, "cancelled; stopping transient task");
            if let Err(e) = ctx.supervisor.stop(&handle, ctx.options.grace_timeout).await {
                warn!(task = %def.name, error = %e, "failed to stop cancelled task");
            }
            return TaskStatus::Skipped(SkipReason::Cancelled);
        }
    };

    match waited {
        Ok(exit) if exit.success() => {
            if let Err(e) = ctx.memo.save(&def.name, fingerprint) {
                warn!(task = %def.name, error = %e, "failed to update transient memo");
            }
            TaskStatus::Succeeded
        }
        Ok(exit) => {
            if let Err(e) = ctx.memo.forget(&def.name) {
                warn!(task = %def.name, error = %e, "failed to clear transient memo");
            }
            warn!(task = %def.name, code = exit.code_or_signal(), "task exited with failure");
            TaskStatus::Failed(TaskFailure::Exited(exit.code_or_signal()))
        }
        Err(e) => TaskStatus::Failed(TaskFailure::Supervisor(format!("{e:#}"))),
    }
}

/// Why a freshly started instance did not become ready.
enum NotReady {
    Exited(i32),
    Unhealthy,
}

async fn run_persistent(
    ctx: &WorkerContext,
    def: &TaskDefinition,
    fingerprint: &str,
    run: &mut TaskRun,
) -> TaskStatus {
    // Re-read right before deciding: another invocation may have written
    // the record since reconciliation.
    let existing = match ctx.store.get(&def.name) {
        Ok(existing) => existing,
        Err(e) => return TaskStatus::Failed(TaskFailure::Store(e.to_string())),
    };

    if let Some(record) = existing {
        let alive = ctx.supervisor.is_alive(&record.handle).await;
        if alive {
            let degraded = record.last_known_status == RecordStatus::Degraded;
            let current = record.fingerprint == fingerprint;
            if current && !degraded {
                debug!(task = %def.name, pid = record.handle.pid, "running instance is current");
                run.output = record.handle.output.clone();
                run.handle = Some(record.handle);
                return TaskStatus::Skipped(SkipReason::AlreadySatisfied);
            }
            // The restart policy covers failures only; changed inputs always
            // replace the instance.
            if current && degraded && !def.restart_policy.permits_restart() {
                warn!(task = %def.name, pid = record.handle.pid, "task is degraded; restart policy is never");
                run.output = record.handle.output.clone();
                run.handle = Some(record.handle);
                return TaskStatus::Skipped(SkipReason::LeftDegraded);
            }

            if *ctx.cancel.borrow() {
                return TaskStatus::Skipped(SkipReason::Cancelled);
            }
            info!(
                task = %def.name,
                pid = record.handle.pid,
                degraded,
                inputs_changed = !current,
                "restarting running instance"
            );
            if let Err(e) = ctx
                .supervisor
                .stop(&record.handle, ctx.options.grace_timeout)
                .await
            {
                error!(task = %def.name, error = %e, "failed to stop running instance");
                return TaskStatus::Failed(TaskFailure::Supervisor(format!("{e:#}")));
            }
        }
        if let Err(e) = ctx.store.remove(&def.name) {
            return TaskStatus::Failed(TaskFailure::Store(e.to_string()));
        }
    }

    let mut cancel = ctx.cancel.clone();
    let retry = ctx.options.retry;
    loop {
        if *cancel.borrow() {
            return TaskStatus::Skipped(SkipReason::Cancelled);
        }

        run.attempts += 1;
        let attempt = run.attempts;
        let handle = match ctx
            .supervisor
            .start(&def.name, &def.command, StartMode::Detached)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(task = %def.name, error = %e, "failed to start task");
                return TaskStatus::Failed(TaskFailure::Spawn(e.to_string()));
            }
        };
        run.output = handle.output.clone();
        run.handle = Some(handle.clone());

        let record = PersistedRecord::new(fingerprint, handle.clone(), RecordStatus::Starting);
        if let Err(e) = ctx.store.put(&def.name, &record) {
            error!(task = %def.name, error = %e, "failed to store record");
            stop_quietly(ctx, def, &handle).await;
            return TaskStatus::Failed(TaskFailure::Store(e.to_string()));
        }

        let readiness = tokio::select! {
            readiness = wait_ready(ctx, def, &handle) => readiness,
            _ = cancelled(&mut cancel) => {
                // Persistent processes outlive cancellation; the Starting
                // record lets the next invocation pick this one up.
                info!(task = %def.name, pid = handle.pid, "cancelled while waiting for readiness");
                return TaskStatus::Skipped(SkipReason::Cancelled);
            }
        };

        let reason = match readiness {
            Ok(()) => {
                if let Err(e) = ctx
                    .store
                    .put(&def.name, &record.with_status(RecordStatus::Running))
                {
                    error!(task = %def.name, error = %e, "failed to store record");
                    return TaskStatus::Failed(TaskFailure::Store(e.to_string()));
                }
                info!(task = %def.name, pid = handle.pid, attempt, "task is running");
                return TaskStatus::Succeeded;
            }
            Err(reason) => reason,
        };

        stop_quietly(ctx, def, &handle).await;

        let failure = match reason {
            NotReady::Exited(code) => TaskFailure::Exited(code),
            NotReady::Unhealthy => TaskFailure::Unhealthy { attempts: attempt },
        };

        if !def.restart_policy.permits_restart() || !retry.allows_another(attempt) {
            warn!(task = %def.name, attempt, failure = %failure, "giving up on task");
            if let Err(e) = ctx.store.remove(&def.name) {
                warn!(task = %def.name, error = %e, "failed to remove record");
            }
            return TaskStatus::Failed(failure);
        }

        let delay = retry.next_delay(attempt);
        warn!(
            task = %def.name,
            attempt,
            failure = %failure,
            delay = ?delay,
            "task did not become ready; retrying"
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancelled(&mut cancel) => {
                if let Err(e) = ctx.store.remove(&def.name) {
                    warn!(task = %def.name, error = %e, "failed to remove record");
                }
                return TaskStatus::Skipped(SkipReason::Cancelled);
            }
        }
    }
}

/// Wait until a fresh instance is ready.
///
/// With a health check, poll every `health_interval` until healthy or
/// `health_timeout` passes. Without one, give it one interval and require
/// it to still be alive.
async fn wait_ready(
    ctx: &WorkerContext,
    def: &TaskDefinition,
    handle: &ProcessHandle,
) -> Result<(), NotReady> {
    let options = &ctx.options;

    let Some(check) = &def.health_check else {
        sleep(options.health_interval).await;
        if ctx.supervisor.is_alive(handle).await {
            return Ok(());
        }
        return Err(exited(ctx, handle).await);
    };

    let deadline = Instant::now() + options.health_timeout;
    loop {
        if !ctx.supervisor.is_alive(handle).await {
            return Err(exited(ctx, handle).await);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let probe_timeout = remaining.min(options.probe_timeout()).max(Duration::from_millis(1));
        match ctx.supervisor.poll_health(handle, check, probe_timeout).await {
            HealthStatus::Healthy => return Ok(()),
            status => debug!(task = %def.name, status = ?status, check = %check, "not healthy yet"),
        }

        if Instant::now() >= deadline {
            warn!(task = %def.name, timeout = ?options.health_timeout, "task did not become healthy in time");
            return Err(NotReady::Unhealthy);
        }
        sleep(options.health_interval).await;
    }
}

async fn exited(ctx: &WorkerContext, handle: &ProcessHandle) -> NotReady {
    let code = match ctx.supervisor.wait(handle).await {
        Ok(status) => status.code_or_signal(),
        Err(e) => {
            debug!(pid = handle.pid, error = %e, "exit status unavailable");
            -1
        }
    };
    NotReady::Exited(code)
}

async fn stop_quietly(ctx: &WorkerContext, def: &TaskDefinition, handle: &ProcessHandle) {
    if let Err(e) = ctx.supervisor.stop(handle, ctx.options.grace_timeout).await {
        warn!(task = %def.name, pid = handle.pid, error = %e, "failed to stop instance");
    }
}
