// src/dag/definition.rs

//! Static task definitions, as handed over by the config layer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::TaskName;
use crate::types::{RestartPolicy, TaskKind};

/// Shell command plus the environment it runs in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Passed to `sh -c` (or `cmd /C` on Windows).
    pub cmd: String,
    /// Working directory; relative paths resolve against the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables on top of the inherited environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// File receiving stdout and stderr, relative to the working directory.
    /// Not part of the fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: None,
            env: BTreeMap::new(),
            output: None,
        }
    }

    /// The working directory resolved against `root`.
    pub fn working_dir(&self, root: &Path) -> PathBuf {
        match &self.cwd {
            Some(cwd) => root.join(cwd),
            None => root.to_path_buf(),
        }
    }

    /// The configured output file resolved against the working directory.
    pub fn output_path(&self, root: &Path) -> Option<PathBuf> {
        self.output
            .as_ref()
            .map(|output| self.working_dir(root).join(output))
    }
}

/// One value that feeds a task's fingerprint.
///
/// In TOML these are written as single-key tables, e.g. `{ file = "a.conf" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintInput {
    /// A literal value.
    Value(String),
    /// Current value of an environment variable (or "unset").
    Env(String),
    /// Content hash of a single file (or "missing").
    File(PathBuf),
    /// Aggregate content hash of all files matching the glob under the
    /// project root.
    Glob(String),
}

/// Readiness/liveness probe for a persistent task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheck {
    /// Shell command; exit status 0 means healthy.
    #[serde(rename = "cmd")]
    Command(String),
    /// `host:port` that must accept a TCP connection.
    Tcp(String),
    /// Regex that must match a line of the task's captured output.
    #[serde(rename = "log")]
    LogPattern(String),
}

impl fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheck::Command(cmd) => write!(f, "cmd `{cmd}`"),
            HealthCheck::Tcp(addr) => write!(f, "tcp {addr}"),
            HealthCheck::LogPattern(pattern) => write!(f, "log /{pattern}/"),
        }
    }
}

/// A validated task definition. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub name: TaskName,
    pub kind: TaskKind,
    pub depends_on: BTreeSet<TaskName>,
    pub command: CommandSpec,
    pub fingerprint_inputs: Vec<FingerprintInput>,
    pub health_check: Option<HealthCheck>,
    pub restart_policy: RestartPolicy,
}

impl TaskDefinition {
    /// A transient task with no dependencies or inputs.
    pub fn transient(name: impl Into<TaskName>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Transient,
            depends_on: BTreeSet::new(),
            command: CommandSpec::new(cmd),
            fingerprint_inputs: Vec::new(),
            health_check: None,
            restart_policy: RestartPolicy::Never,
        }
    }

    /// A persistent task with no dependencies, inputs or health check.
    pub fn persistent(name: impl Into<TaskName>, cmd: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Persistent,
            ..Self::transient(name, cmd)
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.kind, TaskKind::Persistent)
    }
}
