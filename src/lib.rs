// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fingerprint;
pub mod fs;
pub mod logging;
pub mod reconcile;
pub mod state;
pub mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command};
use crate::config::model::ConfigFile;
use crate::config::{
    config_root_dir, load_and_validate_layered, resolve_config_path, user_config_path,
};
use crate::dag::TaskGraph;
use crate::engine::{Environment, RunReport, TaskStatus};
use crate::exec::{StopResult, SystemSupervisor};
use crate::fingerprint::Fingerprinter;
use crate::state::{FileMemo, FileStateStore, MemoryMemo, PersistedRecord, TransientMemo};
use crate::types::{TaskKind, TransientMemoMode};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and graph validation
/// - the file-backed state store and the real process supervisor
/// - the `Environment` facade
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<ExitCode> {
    if let Command::Version = args.command {
        println!("overrun {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    let config_path = resolve_config_path(args.config.as_deref())?;
    let user_config = user_config_path();
    if let Some(user) = &user_config {
        debug!(path = ?user, "using user config");
    }
    let cfg = load_and_validate_layered(&config_path, user_config.as_deref())
        .with_context(|| format!("loading config from {:?}", config_path))?;
    let root = config_root_dir(&config_path);
    let graph = TaskGraph::build(cfg.definitions())?;
    debug!(tasks = graph.len(), root = ?root, "task graph built");

    let concurrency = match &args.command {
        Command::Run { concurrency, .. } => *concurrency,
        _ => None,
    };

    match args.command {
        Command::Plan => {
            print_plan(&cfg, &graph);
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            print_list(&graph, &config_path);
            Ok(ExitCode::SUCCESS)
        }
        Command::Version => Ok(ExitCode::SUCCESS),
        Command::Run { tasks, .. } => {
            let env = build_environment(&cfg, &root, graph, concurrency);

            // Ctrl-C → cancel the run; persistent tasks keep running.
            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    eprintln!("failed to listen for Ctrl+C: {e}");
                    return;
                }
                info!("Ctrl+C received; cancelling run");
                let _ = cancel_tx.send(true);
            });

            let report = env.run_with_cancel(&tasks, cancel_rx).await?;
            print_report(&report);
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Status => {
            let env = build_environment(&cfg, &root, graph, None);
            let status = env.status().await?;
            print_status(&status);
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop { task } => {
            let env = build_environment(&cfg, &root, graph, None);
            let result = env.stop(&task).await?;
            let what = match result {
                StopResult::AlreadyExited => "was not running",
                StopResult::Terminated => "stopped",
                StopResult::Killed => "killed after grace period",
            };
            println!("{task}: {what}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Build the production `Environment` for a validated config.
///
/// Relative paths (state dir, task `cwd`, fingerprint inputs) resolve
/// against `root`, the directory holding the config file.
pub fn build_environment(
    cfg: &ConfigFile,
    root: &Path,
    graph: TaskGraph,
    concurrency: Option<usize>,
) -> Environment {
    let state_dir = cfg.state_dir(root);
    let mut options = cfg.executor_options();
    if let Some(n) = concurrency {
        options.concurrency = n.max(1);
    }

    // Keep our own state and task output out of glob inputs.
    let excluded: Vec<PathBuf> = std::iter::once(state_dir.clone())
        .chain(graph.definitions().filter_map(|def| def.command.output_path(root)))
        .collect();

    let memo: Arc<dyn TransientMemo> = match cfg.config.transient_memo {
        TransientMemoMode::Memory => Arc::new(MemoryMemo::new()),
        TransientMemoMode::File => Arc::new(FileMemo::new(&state_dir)),
    };

    Environment::new(
        graph,
        Arc::new(FileStateStore::new(&state_dir)),
        Arc::new(SystemSupervisor::new(root, &state_dir)),
    )
    .with_fingerprinter(Fingerprinter::new(root).with_excluded(excluded))
    .with_memo(memo)
    .with_options(options)
}

fn print_report(report: &RunReport) {
    for (name, run) in &report.runs {
        let mut line = format!("{name:<20} {}", run.status);
        if let Some(handle) = &run.handle {
            line.push_str(&format!(" [pid {}]", handle.pid));
        }
        if matches!(run.status, TaskStatus::Failed(_)) {
            if let Some(output) = &run.output {
                line.push_str(&format!(" (output: {})", output.display()));
            }
        }
        println!("{line}");
    }
    println!("{}", report.summary());
}

fn print_status(status: &BTreeMap<String, Option<PersistedRecord>>) {
    if status.is_empty() {
        println!("no persistent tasks defined");
        return;
    }
    for (name, record) in status {
        match record {
            Some(record) => println!(
                "{name:<20} {:?} [pid {}]",
                record.last_known_status, record.handle.pid
            ),
            None => println!("{name:<20} not running"),
        }
    }
}

fn print_list(graph: &TaskGraph, config_path: &Path) {
    for def in graph.definitions() {
        let kind = match def.kind {
            TaskKind::Transient => "transient",
            TaskKind::Persistent => "persistent",
        };
        println!("{:<20} {kind:<10} {}", def.name, config_path.display());
    }
}

/// Simple dry-run output: print batches, then per-task details.
fn print_plan(cfg: &ConfigFile, graph: &TaskGraph) {
    println!("overrun plan");
    println!("  config.concurrency = {}", cfg.config.concurrency);
    println!("  config.state_dir = {}", cfg.config.state_dir.display());
    println!();

    println!("batches:");
    for (i, batch) in graph.topological_batches().enumerate() {
        let names: Vec<&str> = batch.iter().map(String::as_str).collect();
        println!("  {i}: {}", names.join(", "));
    }
    println!();

    println!("tasks ({}):", graph.len());
    for def in graph.definitions() {
        println!("  - {} ({:?})", def.name, def.kind);
        println!("      cmd: {}", def.command.cmd);
        if !def.depends_on.is_empty() {
            println!("      after: {:?}", def.depends_on);
        }
        if !def.fingerprint_inputs.is_empty() {
            println!("      inputs: {:?}", def.fingerprint_inputs);
        }
        if let Some(check) = &def.health_check {
            println!("      health: {check}");
        }
        if def.is_persistent() {
            println!("      restart: {:?}", def.restart_policy);
        }
    }

    debug!("plan complete (no execution)");
}
