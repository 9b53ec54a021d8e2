// src/state/memory.rs

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::{PersistedRecord, StateStore, StoreResult};
use crate::engine::TaskName;

/// In-memory [`StateStore`], mainly for tests.
///
/// Clones share the same map, which lets a test play "second invocation"
/// by building a fresh `Environment` over the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    records: Arc<Mutex<BTreeMap<TaskName, PersistedRecord>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store, e.g. with a record whose process has since died.
    pub fn with_record(self, task: impl Into<TaskName>, record: PersistedRecord) -> Self {
        self.lock().insert(task.into(), record);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<TaskName, PersistedRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> StoreResult<BTreeMap<TaskName, PersistedRecord>> {
        Ok(self.lock().clone())
    }

    fn get(&self, task: &str) -> StoreResult<Option<PersistedRecord>> {
        Ok(self.lock().get(task).cloned())
    }

    fn put(&self, task: &str, record: &PersistedRecord) -> StoreResult<()> {
        self.lock().insert(task.to_string(), record.clone());
        debug!(task = %task, "stored record (memory)");
        Ok(())
    }

    fn remove(&self, task: &str) -> StoreResult<()> {
        if self.lock().remove(task).is_some() {
            debug!(task = %task, "removed record (memory)");
        }
        Ok(())
    }
}
