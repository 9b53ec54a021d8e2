use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a task's lifetime relates to the invocation that runs it.
///
/// Scheduling branches on this exhaustively, so a new kind has to be handled
/// everywhere the executor matches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Runs to completion (setup/build steps).
    #[default]
    Transient,
    /// Keeps running after the invocation that started it exits.
    Persistent,
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "transient" => Ok(TaskKind::Transient),
            "persistent" => Ok(TaskKind::Persistent),
            other => Err(format!(
                "invalid task kind: {other} (expected \"transient\" or \"persistent\")"
            )),
        }
    }
}

/// What to do when a persistent task exits or turns unhealthy.
///
/// Ignored for transient tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl RestartPolicy {
    /// Whether failures and degraded instances may be restarted.
    pub fn permits_restart(self) -> bool {
        matches!(self, RestartPolicy::OnFailure | RestartPolicy::Always)
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "never" => Ok(RestartPolicy::Never),
            "on-failure" | "on_failure" => Ok(RestartPolicy::OnFailure),
            "always" => Ok(RestartPolicy::Always),
            other => Err(format!(
                "invalid restart policy: {other} (expected \"never\", \"on-failure\" or \"always\")"
            )),
        }
    }
}

/// Where successful transient fingerprints are remembered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransientMemoMode {
    /// Remember for the lifetime of one `Environment` only.
    Memory,
    /// Store in `<state_dir>/transient-memo` so later invocations reuse it.
    #[default]
    File,
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
