// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{OverrunError, Result};

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV_VAR: &str = "OVERRUN_CONFIG";

/// Project config file name.
pub const DEFAULT_CONFIG_FILE: &str = "Overrun.toml";

/// A directory holding this marks a project root even without a config
/// file (it is where the default state dir lives).
pub const PROJECT_INDICATOR: &str = ".overrun";

/// Per-user defaults for `[config]`, relative to the home directory.
pub const USER_CONFIG_FILE: &str = ".config/overrun/config.toml";

/// Load a configuration file from a given path and return the raw
/// `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    load_layered(path, None)
}

/// Like [`load_from_path`], with `[config]` keys missing from the project
/// file taken from `user` (see [`user_config_path`]).
///
/// The user file may only contain a `[config]` section.
pub fn load_layered(path: impl AsRef<Path>, user: Option<&Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let mut project: Table = toml::from_str(&fs::read_to_string(path)?)?;

    if let Some(user) = user {
        let mut defaults: Table = toml::from_str(&fs::read_to_string(user)?)?;
        if let Some(key) = defaults.keys().find(|k| k.as_str() != "config") {
            return Err(OverrunError::ConfigError(format!(
                "user config {user:?} may only contain a [config] section (found `{key}`)"
            )));
        }
        if let Some(Value::Table(user_config)) = defaults.remove("config") {
            match project
                .entry("config")
                .or_insert(Value::Table(Table::new()))
            {
                Value::Table(config) => merge_missing(config, user_config),
                _ => {
                    return Err(OverrunError::ConfigError(
                        "`config` must be a table".to_string(),
                    ));
                }
            }
        }
        debug!(user = ?user, "applied user config defaults");
    }

    let config: RawConfigFile = Value::Table(project).try_into()?;
    debug!(path = ?path, tasks = config.task.len(), "parsed config file");

    Ok(config)
}

/// Copy every key of `defaults` that `target` lacks, descending into
/// tables present in both.
fn merge_missing(target: &mut Table, defaults: Table) {
    for (key, value) in defaults {
        match (target.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(nested)) => merge_missing(existing, nested),
            (Some(_), _) => {}
            (None, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Load a configuration file from path and validate it.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` default functions).
/// - Checks global settings, durations, commands and patterns.
///
/// The task graph itself (unknown dependencies, cycles) is validated when
/// the definitions are turned into a `TaskGraph`.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    load_and_validate_layered(path, None)
}

/// [`load_and_validate`] on top of the user's `[config]` defaults.
pub fn load_and_validate_layered(path: impl AsRef<Path>, user: Option<&Path>) -> Result<ConfigFile> {
    let raw_config = load_layered(&path, user)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Resolve the config path from the process environment and working
/// directory. See [`resolve_config_path_from`].
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let from_env = std::env::var(CONFIG_ENV_VAR).ok();
    let cwd = std::env::current_dir()?;
    resolve_config_path_from(explicit, from_env.as_deref(), &cwd)
}

/// Resolve the config path:
/// 1. the explicit `--config` argument,
/// 2. `OVERRUN_CONFIG`, which must name an existing file,
/// 3. `Overrun.toml` in the nearest project root at or above `cwd`,
/// 4. `Overrun.toml` in `cwd` (loading it then reports the missing file).
pub fn resolve_config_path_from(
    explicit: Option<&Path>,
    from_env: Option<&str>,
    cwd: &Path,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(value) = from_env.filter(|v| !v.trim().is_empty()) {
        let path = PathBuf::from(value);
        if !path.is_file() {
            return Err(OverrunError::ConfigError(format!(
                "{CONFIG_ENV_VAR} is not a file: {path:?}"
            )));
        }
        return Ok(path);
    }
    match find_project_root(cwd) {
        Some(root) => {
            debug!(root = ?root, "found project root");
            Ok(root.join(DEFAULT_CONFIG_FILE))
        }
        None => Ok(cwd.join(DEFAULT_CONFIG_FILE)),
    }
}

/// Nearest directory at or above `start` that holds `Overrun.toml` or a
/// `.overrun` directory.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| {
            dir.join(DEFAULT_CONFIG_FILE).is_file() || dir.join(PROJECT_INDICATOR).is_dir()
        })
        .map(Path::to_path_buf)
}

/// `~/.config/overrun/config.toml`, if it exists.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(USER_CONFIG_FILE))
        .filter(|path| path.is_file())
}

/// Directory that relative paths in the config resolve against.
///
/// - If the config path has a non-empty parent (e.g. "env/Overrun.toml"),
///   we use that directory.
/// - If it's just a bare filename like "Overrun.toml" (parent = ""),
///   we fall back to the current working directory.
pub fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}
