// src/state/mod.rs

//! State that outlives a single invocation.
//!
//! - [`StateStore`] holds one [`PersistedRecord`] per persistent task. It is
//!   how a later invocation recognises services an earlier one started.
//! - [`memo::TransientMemo`] remembers which fingerprint a transient task
//!   last succeeded with.
//!
//! Both are injected into the [`crate::engine::Environment`]; there is no
//! process-wide store.

use std::collections::BTreeMap;

use crate::engine::TaskName;
use crate::errors::StoreError;

pub mod file;
pub mod memo;
pub mod memory;
pub mod record;

pub use file::FileStateStore;
pub use memo::{FileMemo, MemoryMemo, TransientMemo};
pub use memory::MemoryStateStore;
pub use record::{PersistedRecord, RecordStatus};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persisted record storage.
///
/// Every call takes effect immediately; `put` and `remove` are durable
/// before they return. A record is always replaced as a whole, so a reader
/// never observes a partial write. Corrupt records are reported as absent
/// rather than failing the whole `load`.
pub trait StateStore: Send + Sync {
    fn load(&self) -> StoreResult<BTreeMap<TaskName, PersistedRecord>>;
    fn get(&self, task: &str) -> StoreResult<Option<PersistedRecord>>;
    fn put(&self, task: &str, record: &PersistedRecord) -> StoreResult<()>;
    fn remove(&self, task: &str) -> StoreResult<()>;
}
