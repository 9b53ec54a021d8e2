// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `overrun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "overrun",
    version,
    about = "Keep a workspace's services and setup steps running and up to date.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `OVERRUN_CONFIG`, else `Overrun.toml` in the nearest
    /// directory at or above the current one that holds it or `.overrun/`.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `OVERRUN_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Bring tasks (default: all) and their dependencies up to date.
    Run {
        /// Tasks to run; their dependencies are included automatically.
        #[arg(value_name = "TASK")]
        tasks: Vec<String>,

        /// Override `[config].concurrency`.
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,
    },

    /// Show every persistent task and whether it is running.
    Status,

    /// Stop a persistent task and forget its record.
    Stop {
        #[arg(value_name = "TASK")]
        task: String,
    },

    /// Parse + validate, print the dependency batches, but don't execute
    /// anything.
    Plan,

    /// List every task with its kind and the file defining it.
    List,

    /// Print the version.
    Version,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
