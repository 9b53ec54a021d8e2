// src/config/mod.rs

//! Configuration loading and validation for overrun.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Find and load the config file, layered over user defaults
//!   (`loader.rs`).
//! - Validate settings, commands and patterns (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{
    config_root_dir, find_project_root, load_and_validate, load_and_validate_layered,
    load_from_path, load_layered, resolve_config_path, resolve_config_path_from,
    user_config_path,
};
pub use model::{ConfigFile, ConfigSection, RawConfigFile, RetrySection, TaskConfig};
