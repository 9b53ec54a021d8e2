// src/state/memo.rs

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::info;

use super::file::write_atomic;
use crate::engine::TaskName;

/// File name (below the state dir) of the on-disk memo.
pub const MEMO_FILE: &str = "transient-memo";

/// Remembers the fingerprint each transient task last succeeded with.
///
/// A transient task whose current fingerprint matches its memo entry is
/// reported as already satisfied instead of being run again.
pub trait TransientMemo: Send + Sync {
    fn load(&self, task: &str) -> Result<Option<String>>;
    fn save(&self, task: &str, fingerprint: &str) -> Result<()>;
    /// Drop the entry for `task`, e.g. after it failed.
    fn forget(&self, task: &str) -> Result<()>;
    /// Remove entries for tasks that are not in `active_tasks`.
    fn prune(&self, active_tasks: &[&str]) -> Result<()>;
}

/// Memo that lives as long as the `Environment` holding it.
#[derive(Debug, Default)]
pub struct MemoryMemo {
    map: Mutex<BTreeMap<TaskName, String>>,
}

impl MemoryMemo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TaskName, String>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransientMemo for MemoryMemo {
    fn load(&self, task: &str) -> Result<Option<String>> {
        Ok(self.lock().get(task).cloned())
    }

    fn save(&self, task: &str, fingerprint: &str) -> Result<()> {
        self.lock().insert(task.to_string(), fingerprint.to_string());
        info!(task = %task, fingerprint = %fingerprint, "stored transient memo (memory)");
        Ok(())
    }

    fn forget(&self, task: &str) -> Result<()> {
        self.lock().remove(task);
        Ok(())
    }

    fn prune(&self, active_tasks: &[&str]) -> Result<()> {
        let mut map = self.lock();
        let initial_len = map.len();
        map.retain(|k, _| active_tasks.contains(&k.as_str()));
        if map.len() < initial_len {
            info!(
                removed = initial_len - map.len(),
                "pruned stale transient memo entries (memory)"
            );
        }
        Ok(())
    }
}

/// Memo stored in `<state_dir>/transient-memo`, one `name fingerprint`
/// pair per line.
#[derive(Debug)]
pub struct FileMemo {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileMemo {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(MEMO_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_all(&self) -> Result<BTreeMap<TaskName, String>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading memo file at {:?}", self.path));
            }
        };

        let mut map = BTreeMap::new();
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Fingerprints never contain whitespace; task names might.
            if let Some((name, fingerprint)) = trimmed.rsplit_once(char::is_whitespace) {
                map.insert(name.trim_end().to_string(), fingerprint.to_string());
            }
        }
        Ok(map)
    }

    fn save_all(&self, map: &BTreeMap<TaskName, String>) -> Result<()> {
        let mut out = String::new();
        for (name, fingerprint) in map {
            out.push_str(name);
            out.push(' ');
            out.push_str(fingerprint);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())
            .with_context(|| format!("writing memo file at {:?}", self.path))
    }

    fn update<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeMap<TaskName, String>) -> bool,
    {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.load_all()?;
        let changed = f(&mut map);
        if changed {
            self.save_all(&map)?;
        }
        Ok(changed)
    }
}

impl TransientMemo for FileMemo {
    fn load(&self, task: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load_all()?.remove(task))
    }

    fn save(&self, task: &str, fingerprint: &str) -> Result<()> {
        self.update(|map| {
            map.insert(task.to_string(), fingerprint.to_string()).as_deref() != Some(fingerprint)
        })?;
        info!(task = %task, fingerprint = %fingerprint, "stored transient memo (file)");
        Ok(())
    }

    fn forget(&self, task: &str) -> Result<()> {
        self.update(|map| map.remove(task).is_some())?;
        Ok(())
    }

    fn prune(&self, active_tasks: &[&str]) -> Result<()> {
        let mut removed = 0;
        self.update(|map| {
            let initial_len = map.len();
            map.retain(|k, _| active_tasks.contains(&k.as_str()));
            removed = initial_len - map.len();
            removed > 0
        })?;
        if removed > 0 {
            info!(removed, "pruned stale transient memo entries (file)");
        }
        Ok(())
    }
}
