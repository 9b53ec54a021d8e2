// src/config/validate.rs

use globset::Glob;
use regex::Regex;

use crate::config::model::{ConfigFile, RawConfigFile, TaskConfig};
use crate::dag::definition::{FingerprintInput, HealthCheck};
use crate::engine::{ExecutorOptions, RetryPolicy};
use crate::errors::{OverrunError, Result};
use crate::types::{TaskKind, parse_duration};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = OverrunError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        let options = executor_options(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.config, raw.task, options))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_global_config(cfg)?;
    for (name, task) in cfg.task.iter() {
        validate_task(name, task)?;
    }
    Ok(())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(OverrunError::ConfigError(
            "config must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.config.concurrency == 0 {
        return Err(OverrunError::ConfigError(
            "[config].concurrency must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.config.retry.max_attempts == 0 {
        return Err(OverrunError::ConfigError(
            "[config.retry].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    // Surfaces the first unparsable duration.
    executor_options(cfg).map(|_| ())
}

fn validate_task(name: &str, task: &TaskConfig) -> Result<()> {
    if task.cmd.trim().is_empty() {
        return Err(OverrunError::ConfigError(format!(
            "task '{name}' has an empty `cmd`"
        )));
    }

    for input in &task.inputs {
        if let FingerprintInput::Glob(pattern) = input {
            Glob::new(pattern).map_err(|e| {
                OverrunError::ConfigError(format!(
                    "task '{name}' has invalid glob input '{pattern}': {e}"
                ))
            })?;
        }
    }

    if let Some(check) = &task.health {
        if task.kind != TaskKind::Persistent {
            return Err(OverrunError::ConfigError(format!(
                "task '{name}' has a `health` check but is not persistent"
            )));
        }
        if let HealthCheck::LogPattern(pattern) = check {
            Regex::new(pattern).map_err(|e| {
                OverrunError::ConfigError(format!(
                    "task '{name}' has invalid log health pattern '{pattern}': {e}"
                ))
            })?;
        }
    }

    Ok(())
}

fn executor_options(cfg: &RawConfigFile) -> Result<ExecutorOptions> {
    let c = &cfg.config;
    Ok(ExecutorOptions {
        concurrency: c.concurrency,
        grace_timeout: duration("[config].grace_timeout", &c.grace_timeout)?,
        health_interval: duration("[config].health_interval", &c.health_interval)?,
        health_timeout: duration("[config].health_timeout", &c.health_timeout)?,
        retry: RetryPolicy {
            base: duration("[config.retry].base", &c.retry.base)?,
            cap: duration("[config.retry].cap", &c.retry.cap)?,
            max_attempts: c.retry.max_attempts,
        },
    })
}

fn duration(key: &str, value: &str) -> Result<std::time::Duration> {
    parse_duration(value)
        .map_err(|e| OverrunError::ConfigError(format!("{key} = {value:?}: {e}")))
}
