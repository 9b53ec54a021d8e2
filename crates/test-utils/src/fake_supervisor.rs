#![allow(dead_code)]

//! In-memory `ProcessSupervisor` with a scriptable process table.
//!
//! Nothing here touches the OS. Transient "processes" exit on their own
//! (immediately, or after a scripted delay); persistent ones stay alive
//! until they are stopped or killed through [`FakeSupervisor::kill`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, sleep};

use overrun::dag::{CommandSpec, HealthCheck};
use overrun::errors::SpawnError;
use overrun::exec::{
    BoxFuture, ExitStatus, HealthStatus, ProcessHandle, ProcessSupervisor, StartMode, StopResult,
};

const POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
struct FakeProcess {
    task: String,
    start_time: u64,
    mode: StartMode,
    /// Exit code once the process has exited.
    exit: Option<i32>,
    /// For processes that exit on their own.
    exits_at: Option<(Instant, i32)>,
}

#[derive(Debug, Default)]
struct Script {
    exit_codes: HashMap<String, i32>,
    durations: HashMap<String, Duration>,
    spawn_failures: HashSet<String>,
    dies_after_start: HashMap<String, i32>,
    health: HashMap<String, VecDeque<HealthStatus>>,
}

#[derive(Debug, Default)]
struct Table {
    next_pid: u32,
    processes: HashMap<u32, FakeProcess>,
    script: Script,
    starts: Vec<String>,
    stops: Vec<String>,
    peak_attached: usize,
}

impl Table {
    fn refresh(&mut self, pid: u32) {
        if let Some(p) = self.processes.get_mut(&pid) {
            if p.exit.is_none() {
                if let Some((at, code)) = p.exits_at {
                    if Instant::now() >= at {
                        p.exit = Some(code);
                    }
                }
            }
        }
    }

    fn live_attached(&mut self) -> usize {
        let pids: Vec<u32> = self.processes.keys().copied().collect();
        for pid in pids {
            self.refresh(pid);
        }
        self.processes
            .values()
            .filter(|p| p.mode == StartMode::Attached && p.exit.is_none())
            .count()
    }

    fn alive(&mut self, handle: &ProcessHandle) -> bool {
        self.refresh(handle.pid);
        match self.processes.get(&handle.pid) {
            Some(p) => p.exit.is_none() && p.start_time == handle.start_time,
            None => false,
        }
    }
}

/// Scriptable fake process supervisor. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct FakeSupervisor {
    table: Arc<Mutex<Table>>,
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_pid: 1000,
                ..Table::default()
            })),
        }
    }

    /// Transient `task` exits with `code` (default 0).
    pub fn exit_code(self, task: &str, code: i32) -> Self {
        self.table
            .lock()
            .unwrap()
            .script
            .exit_codes
            .insert(task.to_string(), code);
        self
    }

    /// Transient `task` runs for `duration` before exiting.
    pub fn runs_for(self, task: &str, duration: Duration) -> Self {
        self.table
            .lock()
            .unwrap()
            .script
            .durations
            .insert(task.to_string(), duration);
        self
    }

    /// Starting `task` fails with a spawn error.
    pub fn fail_spawn(self, task: &str) -> Self {
        self.table
            .lock()
            .unwrap()
            .script
            .spawn_failures
            .insert(task.to_string());
        self
    }

    /// Persistent `task` exits with `code` right after every start.
    pub fn dies_after_start(self, task: &str, code: i32) -> Self {
        self.table
            .lock()
            .unwrap()
            .script
            .dies_after_start
            .insert(task.to_string(), code);
        self
    }

    /// Health answers for `task`, consumed one per probe. The last one
    /// repeats. Tasks without a script are healthy.
    pub fn health(&self, task: &str, answers: impl IntoIterator<Item = HealthStatus>) {
        self.table
            .lock()
            .unwrap()
            .script
            .health
            .insert(task.to_string(), answers.into_iter().collect());
    }

    /// Mark the newest live process of `task` as exited with `code`.
    pub fn kill(&self, task: &str, code: i32) {
        let mut table = self.table.lock().unwrap();
        if let Some(p) = table
            .processes
            .iter_mut()
            .filter(|(_, p)| p.task == task && p.exit.is_none())
            .max_by_key(|(pid, _)| **pid)
            .map(|(_, p)| p)
        {
            p.exit = Some(code);
        }
    }

    /// Handle for a process this supervisor never started, as left behind
    /// by an earlier invocation whose process is gone.
    pub fn stale_handle(&self) -> ProcessHandle {
        let mut table = self.table.lock().unwrap();
        let pid = table.next_pid;
        table.next_pid += 1;
        ProcessHandle::new(pid, u64::from(pid) * 10)
    }

    /// Adopt a live detached process for `task`, as if an earlier
    /// invocation had started it.
    pub fn adopt(&self, task: &str) -> ProcessHandle {
        let mut table = self.table.lock().unwrap();
        let pid = table.next_pid;
        table.next_pid += 1;
        let start_time = u64::from(pid) * 10;
        table.processes.insert(
            pid,
            FakeProcess {
                task: task.to_string(),
                start_time,
                mode: StartMode::Detached,
                exit: None,
                exits_at: None,
            },
        );
        ProcessHandle::new(pid, start_time)
    }

    /// Task names in start order.
    pub fn starts(&self) -> Vec<String> {
        self.table.lock().unwrap().starts.clone()
    }

    pub fn start_count(&self, task: &str) -> usize {
        self.starts().iter().filter(|t| *t == task).count()
    }

    /// Task names in the order their processes were stopped.
    pub fn stops(&self) -> Vec<String> {
        self.table.lock().unwrap().stops.clone()
    }

    /// Most transient processes that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.table.lock().unwrap().peak_attached
    }

    /// Tasks with at least one live process.
    pub fn running(&self) -> HashSet<String> {
        let mut table = self.table.lock().unwrap();
        let pids: Vec<u32> = table.processes.keys().copied().collect();
        for pid in pids {
            table.refresh(pid);
        }
        table
            .processes
            .values()
            .filter(|p| p.exit.is_none())
            .map(|p| p.task.clone())
            .collect()
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn start<'a>(
        &'a self,
        task: &'a str,
        spec: &'a CommandSpec,
        mode: StartMode,
    ) -> BoxFuture<'a, Result<ProcessHandle, SpawnError>> {
        Box::pin(async move {
            let mut table = self.table.lock().unwrap();
            table.starts.push(task.to_string());

            if table.script.spawn_failures.contains(task) {
                return Err(SpawnError {
                    command: spec.cmd.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"),
                });
            }

            let pid = table.next_pid;
            table.next_pid += 1;
            let start_time = u64::from(pid) * 10;

            let (exit, exits_at) = match mode {
                StartMode::Attached => {
                    let code = table.script.exit_codes.get(task).copied().unwrap_or(0);
                    match table.script.durations.get(task) {
                        Some(d) => (None, Some((Instant::now() + *d, code))),
                        None => (Some(code), None),
                    }
                }
                StartMode::Detached => (table.script.dies_after_start.get(task).copied(), None),
            };

            table.processes.insert(
                pid,
                FakeProcess {
                    task: task.to_string(),
                    start_time,
                    mode,
                    exit,
                    exits_at,
                },
            );
            let live = table.live_attached();
            table.peak_attached = table.peak_attached.max(live);
            Ok(ProcessHandle::new(pid, start_time))
        })
    }

    fn is_alive<'a>(&'a self, handle: &'a ProcessHandle) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.table.lock().unwrap().alive(handle) })
    }

    fn wait<'a>(&'a self, handle: &'a ProcessHandle) -> BoxFuture<'a, anyhow::Result<ExitStatus>> {
        Box::pin(async move {
            loop {
                {
                    let mut table = self.table.lock().unwrap();
                    table.refresh(handle.pid);
                    match table.processes.get(&handle.pid) {
                        Some(p) => {
                            if let Some(code) = p.exit {
                                return Ok(ExitStatus::from_code(code));
                            }
                        }
                        None => anyhow::bail!("pid {} was not started here", handle.pid),
                    }
                }
                sleep(POLL).await;
            }
        })
    }

    fn stop<'a>(
        &'a self,
        handle: &'a ProcessHandle,
        _grace: Duration,
    ) -> BoxFuture<'a, anyhow::Result<StopResult>> {
        Box::pin(async move {
            let mut table = self.table.lock().unwrap();
            if !table.alive(handle) {
                return Ok(StopResult::AlreadyExited);
            }
            let Some(p) = table.processes.get_mut(&handle.pid) else {
                return Ok(StopResult::AlreadyExited);
            };
            p.exit = Some(-1);
            let task = p.task.clone();
            table.stops.push(task);
            Ok(StopResult::Terminated)
        })
    }

    fn poll_health<'a>(
        &'a self,
        handle: &'a ProcessHandle,
        _check: &'a HealthCheck,
        _timeout: Duration,
    ) -> BoxFuture<'a, HealthStatus> {
        Box::pin(async move {
            let mut table = self.table.lock().unwrap();
            if !table.alive(handle) {
                return HealthStatus::Unhealthy;
            }
            let Some(task) = table.processes.get(&handle.pid).map(|p| p.task.clone()) else {
                return HealthStatus::Unhealthy;
            };
            match table.script.health.get_mut(&task) {
                Some(answers) if answers.len() > 1 => {
                    answers.pop_front().unwrap_or(HealthStatus::Healthy)
                }
                Some(answers) => answers.front().copied().unwrap_or(HealthStatus::Healthy),
                None => HealthStatus::Healthy,
            }
        })
    }
}
