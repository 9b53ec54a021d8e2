// src/state/file.rs

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{PersistedRecord, StateStore, StoreResult};
use crate::engine::TaskName;
use crate::errors::StoreError;

/// Directory (below the state dir) holding one file per record.
pub const RECORDS_DIR: &str = "records";

const RECORD_EXT: &str = "toml";

/// [`StateStore`] keeping one TOML file per task under
/// `<state_dir>/records/`.
///
/// Writes go to a temp file in the same directory, are fsynced, and then
/// renamed over the old record, so a concurrent reader sees either the old
/// or the new record and never a torn one.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join(RECORDS_DIR),
            write_lock: Mutex::new(()),
        }
    }

    pub fn records_dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, task: &str) -> PathBuf {
        self.dir.join(format!("{}.{RECORD_EXT}", encode_task_name(task)))
    }

    fn read_record(&self, task: &str, path: &Path) -> StoreResult<PersistedRecord> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| StoreError::Corrupt {
            task: task.to_string(),
            reason: e.to_string(),
        })
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> StoreResult<BTreeMap<TaskName, PersistedRecord>> {
        let mut records = BTreeMap::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(task) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_task_name)
            else {
                warn!(path = ?path, "ignoring record file with an undecodable name");
                continue;
            };

            match self.read_record(&task, &path) {
                Ok(record) => {
                    records.insert(task, record);
                }
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    // Removed between read_dir and read.
                }
                Err(e) => {
                    warn!(task = %task, error = %e, "treating unreadable record as absent");
                }
            }
        }

        debug!(count = records.len(), dir = ?self.dir, "loaded persisted records");
        Ok(records)
    }

    fn get(&self, task: &str) -> StoreResult<Option<PersistedRecord>> {
        let path = self.record_path(task);
        match self.read_record(task, &path) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e @ StoreError::Corrupt { .. }) => {
                warn!(task = %task, error = %e, "treating unreadable record as absent");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn put(&self, task: &str, record: &PersistedRecord) -> StoreResult<()> {
        let contents = toml::to_string(record).map_err(|e| StoreError::Serialize {
            task: task.to_string(),
            reason: e.to_string(),
        })?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_atomic(&self.record_path(task), contents.as_bytes())?;
        info!(
            task = %task,
            pid = record.handle.pid,
            status = ?record.last_known_status,
            "stored record (file)"
        );
        Ok(())
    }

    fn remove(&self, task: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(self.record_path(task)) {
            Ok(()) => {
                info!(task = %task, "removed record (file)");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Replace `path` with `bytes` via write-temp-then-rename in the same
/// directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // Make the rename itself durable.
    #[cfg(unix)]
    fs::File::open(parent)?.sync_all()?;

    Ok(())
}

/// Keep `[A-Za-z0-9_-]` and percent-encode every other byte so any task name
/// maps to a single safe file name.
pub(crate) fn encode_task_name(task: &str) -> String {
    let mut out = String::with_capacity(task.len());
    for b in task.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_task_name(encoded: &str) -> Option<TaskName> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
