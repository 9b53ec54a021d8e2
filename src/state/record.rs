// src/state/record.rs

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::exec::ProcessHandle;

/// Last status the executor or reconciler observed for a persistent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Spawned, readiness not confirmed yet.
    Starting,
    /// Reached a running (and, if checked, healthy) state.
    Running,
    /// Alive but failing its health check.
    Degraded,
}

/// Persisted belief about one persistent task.
///
/// There is at most one record per task name. It answers "is this task
/// already running, and with what inputs".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Fingerprint that was active when the instance was started.
    pub fingerprint: String,
    pub last_known_status: RecordStatus,
    /// Seconds since the Unix epoch.
    pub started_at: u64,
    pub handle: ProcessHandle,
}

impl PersistedRecord {
    pub fn new(fingerprint: impl Into<String>, handle: ProcessHandle, status: RecordStatus) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            last_known_status: status,
            started_at: unix_now(),
            handle,
        }
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.last_known_status = status;
        self
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
