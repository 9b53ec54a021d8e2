// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dag::definition::{CommandSpec, FingerprintInput, HealthCheck, TaskDefinition};
use crate::engine::ExecutorOptions;
use crate::types::{RestartPolicy, TaskKind, TransientMemoMode};

/// Default location of the state directory, relative to the config file.
pub const DEFAULT_STATE_DIR: &str = ".overrun/state";

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [config]
/// concurrency = 4
///
/// [task.db]
/// kind = "persistent"
/// cmd = "postgres -D data"
/// health = { tcp = "127.0.0.1:5432" }
///
/// [task.migrate]
/// cmd = "./migrate.sh"
/// after = ["db"]
/// inputs = [{ glob = "migrations/*.sql" }]
/// ```
///
/// All sections except the tasks are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    /// Global behaviour config from `[config]`.
    #[serde(default)]
    pub config: ConfigSection,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// Validated configuration.
///
/// Only obtainable through `TryFrom<RawConfigFile>`, so every duration in
/// here is known to parse and every pattern to compile.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub task: BTreeMap<String, TaskConfig>,
    options: ExecutorOptions,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        config: ConfigSection,
        task: BTreeMap<String, TaskConfig>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            config,
            task,
            options,
        }
    }

    /// Executor knobs with every duration already parsed.
    pub fn executor_options(&self) -> ExecutorOptions {
        self.options
    }

    /// State directory, resolved against `root` (the config file's
    /// directory) when relative.
    pub fn state_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.config.state_dir)
    }

    /// Task definitions in name order. Graph structure (unknown
    /// dependencies, cycles) is checked by `TaskGraph::build`.
    pub fn definitions(&self) -> Vec<TaskDefinition> {
        self.task
            .iter()
            .map(|(name, task)| task.to_definition(name))
            .collect()
    }
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Maximum number of tasks worked on at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Where records, logs and the transient memo live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// SIGTERM-to-SIGKILL grace period, e.g. `"5s"`.
    #[serde(default = "default_grace_timeout")]
    pub grace_timeout: String,

    /// Gap between health polls, e.g. `"500ms"`.
    #[serde(default = "default_health_interval")]
    pub health_interval: String,

    /// How long a persistent task may take to become healthy, e.g. `"30s"`.
    #[serde(default = "default_health_timeout")]
    pub health_timeout: String,

    /// `"file"` (default) or `"memory"`.
    #[serde(default)]
    pub transient_memo: TransientMemoMode,

    /// `[config.retry]`.
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_concurrency() -> usize {
    4
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_grace_timeout() -> String {
    "5s".to_string()
}

fn default_health_interval() -> String {
    "500ms".to_string()
}

fn default_health_timeout() -> String {
    "30s".to_string()
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            state_dir: default_state_dir(),
            grace_timeout: default_grace_timeout(),
            health_interval: default_health_interval(),
            health_timeout: default_health_timeout(),
            transient_memo: TransientMemoMode::default(),
            retry: RetrySection::default(),
        }
    }
}

/// `[config.retry]` section: backoff for persistent task restarts.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_retry_base")]
    pub base: String,

    #[serde(default = "default_retry_cap")]
    pub cap: String,

    /// Total starts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_retry_base() -> String {
    "1s".to_string()
}

fn default_retry_cap() -> String {
    "30s".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base: default_retry_base(),
            cap: default_retry_cap(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// `"transient"` (default) or `"persistent"`.
    #[serde(default)]
    pub kind: TaskKind,

    /// The shell command to execute.
    pub cmd: String,

    /// Working directory, relative to the config file's directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Dependency list: this task waits for all tasks listed here.
    #[serde(default)]
    pub after: Vec<String>,

    /// Values that feed the fingerprint, e.g.
    /// `[{ file = "a.conf" }, { env = "PORT" }, { glob = "src/**/*.rs" }]`.
    #[serde(default)]
    pub inputs: Vec<FingerprintInput>,

    /// `"never"` (default), `"on-failure"` or `"always"`.
    #[serde(default)]
    pub restart: RestartPolicy,

    /// `{ cmd = "..." }`, `{ tcp = "host:port" }` or `{ log = "regex" }`.
    #[serde(default)]
    pub health: Option<HealthCheck>,

    /// Where to write the command's output, relative to `cwd`. Defaults to
    /// `<state_dir>/logs/<task>.log`.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl TaskConfig {
    pub fn to_definition(&self, name: &str) -> TaskDefinition {
        TaskDefinition {
            name: name.to_string(),
            kind: self.kind,
            depends_on: self.after.iter().cloned().collect(),
            command: CommandSpec {
                cmd: self.cmd.clone(),
                cwd: self.cwd.clone(),
                env: self.env.clone(),
                output: self.output.clone(),
            },
            fingerprint_inputs: self.inputs.clone(),
            health_check: self.health.clone(),
            restart_policy: self.restart,
        }
    }
}
