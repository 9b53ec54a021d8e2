// src/exec/mod.rs

//! Process supervision layer.
//!
//! Everything the executor and the reconciler need from the operating
//! system goes through the [`ProcessSupervisor`] capability:
//!
//! - [`backend`] defines the trait and the small value types it speaks in.
//! - [`system`] is the real implementation on top of `tokio::process`,
//!   `sysinfo` and process-group signals.
//! - [`health`] evaluates a [`crate::dag::definition::HealthCheck`] against
//!   a running process.
//!
//! Tests swap in the `FakeSupervisor` from the test-utils crate.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod health;
pub mod system;

pub use backend::{BoxFuture, ProcessSupervisor};
pub use system::SystemSupervisor;

/// Identifies one OS process across invocations.
///
/// `start_time` (seconds since the Unix epoch, as reported by the OS) guards
/// against PID reuse: a live process with the same pid but a different start
/// time is a different process. `0` means the start time was not observable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub start_time: u64,
    /// File receiving the process's stdout and stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl ProcessHandle {
    pub fn new(pid: u32, start_time: u64) -> Self {
        Self {
            pid,
            start_time,
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// How a process relates to the invocation that starts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Killed when the supervisor drops it. Used for transient tasks.
    Attached,
    /// Own process group, survives the tool exiting. Used for persistent
    /// tasks.
    Detached,
}

/// Exit status of a waited-on process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, with `-1` standing in for "killed by a signal".
    pub fn code_or_signal(&self) -> i32 {
        self.code.unwrap_or(-1)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// Nothing to stop; the process was already gone.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// The check could not be evaluated (bad pattern, no captured output).
    Unknown,
}
