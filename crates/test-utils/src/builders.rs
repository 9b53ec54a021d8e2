#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use overrun::config::{ConfigFile, ConfigSection, RawConfigFile, TaskConfig};
use overrun::dag::{FingerprintInput, HealthCheck, TaskDefinition, TaskGraph};
use overrun::engine::{ExecutorOptions, RetryPolicy};
use overrun::types::{RestartPolicy, TaskKind};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                task: BTreeMap::new(),
            },
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.config.config.concurrency = n;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }

    /// Build the config and its task graph in one go.
    pub fn build_graph(self) -> TaskGraph {
        let cfg = self.build();
        TaskGraph::build(cfg.definitions()).expect("Failed to build task graph from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                kind: TaskKind::Transient,
                cmd: cmd.to_string(),
                cwd: None,
                env: BTreeMap::new(),
                after: Vec::new(),
                inputs: Vec::new(),
                restart: RestartPolicy::Never,
                health: None,
                output: None,
            },
        }
    }

    pub fn persistent(mut self) -> Self {
        self.task.kind = TaskKind::Persistent;
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn input(mut self, input: FingerprintInput) -> Self {
        self.task.inputs.push(input);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.task.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.task.restart = policy;
        self
    }

    pub fn health(mut self, check: HealthCheck) -> Self {
        self.task.health = Some(check);
        self
    }

    pub fn output(mut self, path: &str) -> Self {
        self.task.output = Some(path.into());
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Transient definition depending on `deps`.
pub fn transient(name: &str, deps: &[&str]) -> TaskDefinition {
    let mut def = TaskDefinition::transient(name, format!("echo {name}"));
    def.depends_on = deps.iter().map(|d| d.to_string()).collect();
    def
}

/// Persistent definition depending on `deps`.
pub fn persistent(name: &str, deps: &[&str]) -> TaskDefinition {
    let mut def = TaskDefinition::persistent(name, format!("serve {name}"));
    def.depends_on = deps.iter().map(|d| d.to_string()).collect();
    def
}

/// Executor options with durations small enough for tests.
pub fn fast_options() -> ExecutorOptions {
    ExecutorOptions {
        concurrency: 4,
        grace_timeout: Duration::from_millis(50),
        health_interval: Duration::from_millis(5),
        health_timeout: Duration::from_millis(100),
        retry: RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            max_attempts: 3,
        },
    }
}
