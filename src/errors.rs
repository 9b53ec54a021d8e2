// src/errors.rs

//! Crate-wide error types.
//!
//! Errors are split by how far they reach:
//! - [`DefinitionError`] aborts a whole run before anything executes.
//! - [`SpawnError`] and [`StoreError`] are attributed to a single task.
//! - [`OverrunError`] is what the public API returns.

use thiserror::Error;

use crate::engine::TaskName;

/// Structural problems with the set of task definitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("task name must not be empty")]
    EmptyName,

    #[error("task '{0}' is defined more than once")]
    DuplicateName(TaskName),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        task: TaskName,
        dependency: TaskName,
    },

    /// `path` starts and ends with the same task; each element depends on
    /// the next one.
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<TaskName> },
}

/// A process could not be started at all.
#[derive(Error, Debug)]
#[error("failed to spawn '{command}': {source}")]
pub struct SpawnError {
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

/// A health probe did not answer within its timeout. Treated as unhealthy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("health check '{check}' timed out after {timeout:?}")]
pub struct HealthCheckTimeout {
    pub check: String,
    pub timeout: std::time::Duration,
}

/// Failures of the persisted state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("state store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record for task '{task}' is unreadable: {reason}")]
    Corrupt { task: TaskName, reason: String },

    #[error("failed to serialize record for task '{task}': {reason}")]
    Serialize { task: TaskName, reason: String },
}

#[derive(Error, Debug)]
pub enum OverrunError {
    #[error("Invalid task definitions: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskName),

    #[error("Task '{0}' is not persistent")]
    NotPersistent(TaskName),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, OverrunError>;
