// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use super::report::{RunReport, TaskFailure, TaskRun, TaskStatus};
use super::worker::{self, WorkerContext, cancelled};
use super::{RuntimeEvent, TaskName};
use crate::dag::{ScheduledTask, Scheduler, SchedulerStep};

/// Drives the DAG scheduler in response to `RuntimeEvent`s and runs the
/// tasks it schedules as bounded-concurrency workers.
///
/// The scheduler owns all dependency semantics; this struct handles the
/// async IO: spawning workers, receiving their results and reacting to
/// cancellation.
pub struct Runtime {
    scheduler: Scheduler,
    ctx: WorkerContext,
    permits: Arc<Semaphore>,
    event_tx: mpsc::Sender<RuntimeEvent>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    in_flight: usize,
    report: RunReport,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(scheduler: Scheduler, ctx: WorkerContext) -> Self {
        let (event_tx, event_rx) = mpsc::channel::<RuntimeEvent>(64);
        let permits = Arc::new(Semaphore::new(ctx.options.concurrency.max(1)));
        Self {
            scheduler,
            ctx,
            permits,
            event_tx,
            event_rx,
            in_flight: 0,
            report: RunReport::default(),
        }
    }

    /// Main event loop.
    ///
    /// - Starts a run for `requested` (plus dependencies).
    /// - Dispatches ready tasks as workers.
    /// - Feeds `TaskFinished` events back into the scheduler.
    /// - On cancellation, resolves everything still pending.
    ///
    /// Returns once every task of the run is terminal.
    pub async fn run(mut self, requested: &[TaskName]) -> RunReport {
        info!(concurrency = self.ctx.options.concurrency, "runtime started");

        let step = self.scheduler.start_run(requested);
        self.apply(step);

        let mut cancel = self.ctx.cancel.clone();
        let mut cancel_seen = false;

        while self.in_flight > 0 || !self.scheduler.is_idle() {
            tokio::select! {
                event = self.event_rx.recv() => {
                    // We hold a sender ourselves, so the channel never closes.
                    let Some(event) = event else { break };
                    debug!(?event, "runtime received event");
                    self.handle_event(event);
                }
                _ = cancelled(&mut cancel), if !cancel_seen => {
                    cancel_seen = true;
                    info!("cancellation requested");
                    let step = self.scheduler.cancel();
                    self.apply(step);
                }
            }
        }

        info!(summary = %self.report.summary(), "runtime exiting");
        self.report
    }

    fn handle_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::TaskFinished { run } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let step = self.scheduler.complete(&run.task_name, run.status.clone());
                self.report.runs.insert(run.task_name.clone(), run);
                self.apply(step);
            }
        }
    }

    fn apply(&mut self, step: SchedulerStep) {
        for (name, reason) in step.newly_skipped {
            let Some(def) = self.scheduler.graph().get(&name) else {
                warn!(task = %name, "skipped task missing from graph");
                continue;
            };
            info!(task = %name, reason = %reason, "task skipped");
            self.report
                .runs
                .insert(name.clone(), TaskRun::skipped(def, reason));
        }

        for task in step.newly_scheduled {
            self.spawn_worker(task);
        }

        if step.run_just_finished {
            debug!("scheduler reports run finished");
        }
    }

    fn spawn_worker(&mut self, task: ScheduledTask) {
        self.in_flight += 1;

        let ctx = self.ctx.clone();
        let permits = Arc::clone(&self.permits);
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let def = task.definition;
            let name = def.name.clone();
            let fallback = TaskRun::new(&def);

            let run = match permits.acquire_owned().await {
                Ok(permit) => {
                    // A panicking worker still has to report back, or the
                    // run would never finish.
                    let worker = tokio::spawn(async move {
                        let _permit = permit;
                        worker::run_task(ctx, def).await
                    });
                    match worker.await {
                        Ok(run) => run,
                        Err(e) => {
                            error!(task = %name, error = %e, "worker crashed");
                            failed(fallback, format!("worker crashed: {e}"))
                        }
                    }
                }
                Err(e) => failed(fallback, format!("no execution slot: {e}")),
            };

            if tx.send(RuntimeEvent::TaskFinished { run }).await.is_err() {
                warn!(task = %name, "runtime gone before task finished");
            }
        });
    }
}

fn failed(mut run: TaskRun, reason: String) -> TaskRun {
    run.finish(TaskStatus::Failed(TaskFailure::Supervisor(reason)));
    run
}
