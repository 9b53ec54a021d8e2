// src/exec/system.rs

//! [`ProcessSupervisor`] backed by real OS processes.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sysinfo::{Pid, PidExt, ProcessExt, ProcessStatus, System, SystemExt};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::backend::{BoxFuture, ProcessSupervisor};
use super::{ExitStatus, HealthStatus, ProcessHandle, StartMode, StopResult, health};
use crate::dag::definition::{CommandSpec, HealthCheck};
use crate::errors::SpawnError;
use crate::state::file::encode_task_name;

/// Directory (below the state dir) receiving task output.
pub const LOGS_DIR: &str = "logs";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for the kernel to tear a process down after SIGKILL.
const KILL_SETTLE: Duration = Duration::from_secs(2);

/// Build a shell command appropriate for the platform.
pub(crate) fn shell_command(line: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(line);
        c
    }
}

/// Spawns tasks through the shell and tracks them through `sysinfo`.
///
/// Children started by this supervisor are kept in a table so they can be
/// waited on and reaped. Processes from earlier invocations are only known
/// by their [`ProcessHandle`] and are observed through `sysinfo` alone.
pub struct SystemSupervisor {
    root: PathBuf,
    log_dir: PathBuf,
    children: Mutex<HashMap<u32, Arc<tokio::sync::Mutex<Child>>>>,
    system: Mutex<System>,
}

impl SystemSupervisor {
    /// `root` is where relative working directories resolve; output goes
    /// to `<state_dir>/logs/<task>.log` unless the task names its own file.
    pub fn new(root: impl Into<PathBuf>, state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: root.into(),
            log_dir: state_dir.as_ref().join(LOGS_DIR),
            children: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
        }
    }

    pub fn log_path(&self, task: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", encode_task_name(task)))
    }

    fn children(&self) -> MutexGuard<'_, HashMap<u32, Arc<tokio::sync::Mutex<Child>>>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn child(&self, pid: u32) -> Option<Arc<tokio::sync::Mutex<Child>>> {
        self.children().get(&pid).cloned()
    }


    /// Where `task`'s output goes: its configured `output`, else the
    /// default log file.
    pub fn output_path(&self, task: &str, spec: &CommandSpec) -> PathBuf {
        spec.output_path(&self.root)
            .unwrap_or_else(|| self.log_path(task))
    }

    fn spawn(&self, task: &str, spec: &CommandSpec, mode: StartMode) -> io::Result<ProcessHandle> {
        let log_path = self.output_path(task, spec);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = shell_command(&spec.cmd);
        cmd.current_dir(spec.working_dir(&self.root))
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(mode == StartMode::Attached);

        // Own process group, so signals reach the whole tree and a Ctrl-C
        // in the terminal does not.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before its pid was read"))?;
        let start_time = self.observe(pid).map(|(start, _)| start).unwrap_or(0);

        self.children()
            .insert(pid, Arc::new(tokio::sync::Mutex::new(child)));

        Ok(ProcessHandle::new(pid, start_time).with_output(log_path))
    }

    /// `(start_time, status)` of `pid`, if the OS knows it.
    fn observe(&self, pid: u32) -> Option<(u64, ProcessStatus)> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| (p.start_time(), p.status()))
    }

    /// Reap our own child if it has exited. Returns true if it is gone.
    ///
    /// The child stays in the table so a later `wait` can still report its
    /// exit status; `wait` and `stop` drop it.
    fn reap_if_exited(&self, pid: u32) -> bool {
        let Some(child) = self.child(pid) else {
            return false;
        };
        // A held lock means someone is waiting on it; leave reaping to them.
        let Ok(mut guard) = child.try_lock() else {
            return false;
        };
        match guard.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, code = ?status.code(), "child has exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid, error = %e, "try_wait failed");
                false
            }
        }
    }

    fn check_alive(&self, handle: &ProcessHandle) -> bool {
        if self.reap_if_exited(handle.pid) {
            return false;
        }
        match self.observe(handle.pid) {
            None => false,
            Some((_, ProcessStatus::Zombie | ProcessStatus::Dead)) => false,
            Some((start_time, _)) => {
                if handle.start_time != 0 && start_time != handle.start_time {
                    debug!(
                        pid = handle.pid,
                        expected = handle.start_time,
                        found = start_time,
                        "pid was reused by another process"
                    );
                    return false;
                }
                true
            }
        }
    }

    async fn wait_for_exit(&self, handle: &ProcessHandle, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.check_alive(handle) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    async fn stop_inner(&self, handle: &ProcessHandle, grace: Duration) -> Result<StopResult> {
        if !self.check_alive(handle) {
            self.children().remove(&handle.pid);
            return Ok(StopResult::AlreadyExited);
        }

        info!(pid = handle.pid, grace = ?grace, "terminating process group");
        self.signal(handle, Signal::Terminate)?;
        if self.wait_for_exit(handle, grace).await {
            self.children().remove(&handle.pid);
            return Ok(StopResult::Terminated);
        }

        warn!(pid = handle.pid, "process ignored SIGTERM; killing");
        self.signal(handle, Signal::Kill)?;
        if !self.wait_for_exit(handle, KILL_SETTLE).await {
            return Err(anyhow!("process {} survived SIGKILL", handle.pid));
        }
        self.children().remove(&handle.pid);
        Ok(StopResult::Killed)
    }

    #[cfg(unix)]
    fn signal(&self, handle: &ProcessHandle, signal: Signal) -> Result<()> {
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pid = libc::pid_t::try_from(handle.pid)
            .with_context(|| format!("pid {} out of range", handle.pid))?;

        // SAFETY: plain syscalls on integer arguments.
        let rc = unsafe { libc::killpg(pid, sig) };
        if rc == 0 {
            return Ok(());
        }
        // Not a group leader (e.g. started by something else); signal the
        // process alone.
        // SAFETY: as above; `pid` was range-checked into a `pid_t`.
        let rc = unsafe { libc::kill(pid, sig) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err).with_context(|| format!("signalling process {}", handle.pid))
    }

    #[cfg(not(unix))]
    fn signal(&self, handle: &ProcessHandle, _signal: Signal) -> Result<()> {
        if let Some(child) = self.child(handle.pid) {
            if let Ok(mut guard) = child.try_lock() {
                return guard.start_kill().context("killing child process");
            }
        }
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(handle.pid);
        system.refresh_process(pid);
        if let Some(process) = system.process(pid) {
            process.kill();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

impl ProcessSupervisor for SystemSupervisor {
    fn start<'a>(
        &'a self,
        task: &'a str,
        spec: &'a CommandSpec,
        mode: StartMode,
    ) -> BoxFuture<'a, Result<ProcessHandle, SpawnError>> {
        Box::pin(async move {
            let handle = self.spawn(task, spec, mode).map_err(|source| SpawnError {
                command: spec.cmd.clone(),
                source,
            })?;
            info!(
                task = %task,
                pid = handle.pid,
                mode = ?mode,
                cmd = %spec.cmd,
                "started task process"
            );
            Ok(handle)
        })
    }

    fn is_alive<'a>(&'a self, handle: &'a ProcessHandle) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.check_alive(handle) })
    }

    fn wait<'a>(&'a self, handle: &'a ProcessHandle) -> BoxFuture<'a, Result<ExitStatus>> {
        Box::pin(async move {
            let child = self.child(handle.pid).ok_or_else(|| {
                anyhow!("process {} was not started by this invocation", handle.pid)
            })?;
            let status = child
                .lock()
                .await
                .wait()
                .await
                .with_context(|| format!("waiting for process {}", handle.pid))?;
            self.children().remove(&handle.pid);
            debug!(pid = handle.pid, code = ?status.code(), "process exited");
            Ok(ExitStatus::from(status))
        })
    }

    fn stop<'a>(
        &'a self,
        handle: &'a ProcessHandle,
        grace: Duration,
    ) -> BoxFuture<'a, Result<StopResult>> {
        Box::pin(self.stop_inner(handle, grace))
    }

    fn poll_health<'a>(
        &'a self,
        handle: &'a ProcessHandle,
        check: &'a HealthCheck,
        timeout: Duration,
    ) -> BoxFuture<'a, HealthStatus> {
        Box::pin(async move {
            if !self.check_alive(handle) {
                return HealthStatus::Unhealthy;
            }
            health::probe(check, &self.root, handle.output.as_deref(), timeout).await
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervisor() -> (tempfile::TempDir, SystemSupervisor) {
        let dir = tempfile::tempdir().unwrap();
        let sup = SystemSupervisor::new(dir.path(), dir.path().join("state"));
        (dir, sup)
    }

    #[tokio::test]
    async fn attached_process_output_is_captured() {
        let (_dir, sup) = supervisor();
        let spec = CommandSpec::new("echo hello; exit 3");

        let handle = sup.start("greet", &spec, StartMode::Attached).await.unwrap();
        let status = sup.wait(&handle).await.unwrap();

        assert_eq!(status.code, Some(3));
        let output = fs::read_to_string(handle.output.unwrap()).unwrap();
        assert!(output.contains("hello"));
    }

    #[tokio::test]
    async fn configured_output_file_is_used() {
        let (dir, sup) = supervisor();
        fs::create_dir_all(dir.path().join("web")).unwrap();
        let mut spec = CommandSpec::new("echo serving");
        spec.cwd = Some("web".into());
        spec.output = Some("logs/web.out".into());

        let handle = sup.start("web", &spec, StartMode::Attached).await.unwrap();
        sup.wait(&handle).await.unwrap();

        let expected = dir.path().join("web/logs/web.out");
        assert_eq!(handle.output.as_deref(), Some(expected.as_path()));
        assert!(fs::read_to_string(&expected).unwrap().contains("serving"));
        assert!(!sup.log_path("web").exists());
    }

    #[tokio::test]
    async fn detached_process_is_stopped_with_sigterm() {
        let (_dir, sup) = supervisor();
        let spec = CommandSpec::new("sleep 30");

        let handle = sup.start("svc", &spec, StartMode::Detached).await.unwrap();
        assert!(sup.is_alive(&handle).await);

        let result = sup.stop(&handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result, StopResult::Terminated);
        assert!(!sup.is_alive(&handle).await);

        let again = sup.stop(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again, StopResult::AlreadyExited);
    }

    #[tokio::test]
    async fn reused_pid_is_not_alive() {
        let (_dir, sup) = supervisor();
        let spec = CommandSpec::new("sleep 30");
        let handle = sup.start("svc", &spec, StartMode::Detached).await.unwrap();

        let mut stale = handle.clone();
        stale.start_time = handle.start_time.saturating_sub(1000).max(1);
        if stale.start_time != handle.start_time {
            assert!(!sup.is_alive(&stale).await);
        }

        sup.stop(&handle, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_in_missing_directory() {
        let (_dir, sup) = supervisor();
        let mut spec = CommandSpec::new("true");
        spec.cwd = Some("does/not/exist".into());

        let err = sup.start("broken", &spec, StartMode::Attached).await.unwrap_err();
        assert_eq!(err.command, "true");
    }
}
