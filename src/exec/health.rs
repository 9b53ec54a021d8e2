// src/exec/health.rs

//! One-shot evaluation of a [`HealthCheck`].
//!
//! The supervisor checks liveness first; the probes here only answer
//! "does the service respond".

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tokio::time::timeout as with_deadline;
use tracing::{debug, warn};

use super::HealthStatus;
use crate::dag::definition::HealthCheck;
use crate::errors::HealthCheckTimeout;

/// Run `check` once.
///
/// `cwd` is where command probes run, `output` is the task's captured
/// output file (needed by log probes).
pub async fn probe(
    check: &HealthCheck,
    cwd: &Path,
    output: Option<&Path>,
    timeout: Duration,
) -> HealthStatus {
    let status = match check {
        HealthCheck::Command(cmd) => probe_command(cmd, cwd, timeout).await,
        HealthCheck::Tcp(addr) => probe_tcp(addr, timeout).await,
        HealthCheck::LogPattern(pattern) => match output {
            Some(path) => probe_log(pattern, path).await,
            None => {
                debug!(pattern = %pattern, "no captured output to match against");
                Ok(HealthStatus::Unknown)
            }
        },
    };

    status.unwrap_or_else(|e| {
        warn!(check = %check, error = %e, "health check timed out");
        HealthStatus::Unhealthy
    })
}

async fn probe_command(
    cmd: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<HealthStatus, HealthCheckTimeout> {
    let mut command = super::system::shell_command(cmd);
    command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(cmd = %cmd, error = %e, "failed to spawn health check command");
            return Ok(HealthStatus::Unknown);
        }
    };

    match with_deadline(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(HealthStatus::Healthy),
        Ok(Ok(status)) => {
            debug!(cmd = %cmd, code = ?status.code(), "health check command failed");
            Ok(HealthStatus::Unhealthy)
        }
        Ok(Err(e)) => {
            warn!(cmd = %cmd, error = %e, "failed to wait for health check command");
            Ok(HealthStatus::Unknown)
        }
        Err(_) => Err(HealthCheckTimeout {
            check: format!("cmd `{cmd}`"),
            timeout,
        }),
    }
}

async fn probe_tcp(addr: &str, timeout: Duration) -> Result<HealthStatus, HealthCheckTimeout> {
    match with_deadline(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(HealthStatus::Healthy),
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "tcp health check refused");
            Ok(HealthStatus::Unhealthy)
        }
        Err(_) => Err(HealthCheckTimeout {
            check: format!("tcp {addr}"),
            timeout,
        }),
    }
}

async fn probe_log(pattern: &str, output: &Path) -> Result<HealthStatus, HealthCheckTimeout> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid log health pattern");
            return Ok(HealthStatus::Unknown);
        }
    };

    match tokio::fs::read(output).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            if text.lines().any(|line| re.is_match(line)) {
                Ok(HealthStatus::Healthy)
            } else {
                Ok(HealthStatus::Unhealthy)
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HealthStatus::Unhealthy),
        Err(e) => {
            warn!(path = ?output, error = %e, "failed to read captured output");
            Ok(HealthStatus::Unknown)
        }
    }
}
