// src/exec/backend.rs

//! Pluggable process supervisor abstraction.
//!
//! The executor and reconciler talk to a `ProcessSupervisor` instead of
//! spawning processes themselves. Production code uses
//! [`super::SystemSupervisor`]; tests provide an in-memory process table
//! that never touches the OS.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;

use super::{ExitStatus, HealthStatus, ProcessHandle, StartMode, StopResult};
use crate::dag::definition::{CommandSpec, HealthCheck};
use crate::errors::SpawnError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability to start, observe and stop OS processes.
pub trait ProcessSupervisor: Send + Sync {
    /// Start `spec` on behalf of `task`.
    ///
    /// `StartMode::Detached` processes must keep running after the tool
    /// exits.
    fn start<'a>(
        &'a self,
        task: &'a str,
        spec: &'a CommandSpec,
        mode: StartMode,
    ) -> BoxFuture<'a, Result<ProcessHandle, SpawnError>>;

    /// Whether the process behind `handle` still runs. A reused pid (same
    /// pid, different start time) is not alive.
    fn is_alive<'a>(&'a self, handle: &'a ProcessHandle) -> BoxFuture<'a, bool>;

    /// Wait for a process this supervisor started to exit.
    fn wait<'a>(&'a self, handle: &'a ProcessHandle) -> BoxFuture<'a, Result<ExitStatus>>;

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    fn stop<'a>(
        &'a self,
        handle: &'a ProcessHandle,
        grace: Duration,
    ) -> BoxFuture<'a, Result<StopResult>>;

    /// Evaluate `check` once. A dead process is unhealthy; a probe that
    /// exceeds `timeout` is unhealthy.
    fn poll_health<'a>(
        &'a self,
        handle: &'a ProcessHandle,
        check: &'a HealthCheck,
        timeout: Duration,
    ) -> BoxFuture<'a, HealthStatus>;
}
