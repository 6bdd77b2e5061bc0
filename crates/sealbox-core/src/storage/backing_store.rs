use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single value as the backing store holds it. The width of numeric
/// variants is preserved, so `Int32(1)` and `Int64(1)` are distinct entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
}

/// Consistent read of every entry in the backing store.
pub type Snapshot = BTreeMap<String, StoredValue>;

/// One step of an atomic multi-entry transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Insert or overwrite `name`.
    Put { name: String, value: StoredValue },
    /// Remove `name`; absence is not an error.
    Remove { name: String },
}

impl Edit {
    pub fn put(name: impl Into<String>, value: StoredValue) -> Self {
        Self::Put {
            name: name.into(),
            value,
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        Self::Remove { name: name.into() }
    }
}

/// Errors produced by backing store implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackingStoreError {
    /// Underlying persistence failure (disk full, permission denied, corrupt file).
    #[error("backing store failure: {reason}")]
    Storage { reason: String },
}

/// Durable mapping from entry name to a primitive value.
///
/// Implementations must apply each `edit` call as one transaction: either
/// every step lands or none does, and a concurrent `snapshot` never observes
/// a half-applied edit.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Read one entry.
    async fn get(&self, name: &str) -> Result<Option<StoredValue>, BackingStoreError>;

    /// Apply a batch of edits atomically.
    async fn edit(&self, edits: Vec<Edit>) -> Result<(), BackingStoreError>;

    /// Consistent view of the whole mapping.
    async fn snapshot(&self) -> Result<Snapshot, BackingStoreError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), BackingStoreError>;

    async fn put(&self, name: &str, value: StoredValue) -> Result<(), BackingStoreError> {
        self.edit(vec![Edit::put(name, value)]).await
    }

    async fn remove(&self, name: &str) -> Result<(), BackingStoreError> {
        self.edit(vec![Edit::remove(name)]).await
    }
}

/// Apply `edits` to an in-memory mapping. Shared by implementations that
/// hold the whole mapping and persist it as a unit.
pub fn apply_edits(map: &mut Snapshot, edits: Vec<Edit>) {
    for edit in edits {
        match edit {
            Edit::Put { name, value } => {
                map.insert(name, value);
            }
            Edit::Remove { name } => {
                map.remove(&name);
            }
        }
    }
}

/// Volatile backing store for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackingStore {
    inner: Arc<Mutex<Snapshot>>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Snapshot>, BackingStoreError> {
        self.inner.lock().map_err(|err| BackingStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn get(&self, name: &str) -> Result<Option<StoredValue>, BackingStoreError> {
        Ok(self.lock()?.get(name).cloned())
    }

    async fn edit(&self, edits: Vec<Edit>) -> Result<(), BackingStoreError> {
        let mut map = self.lock()?;
        apply_edits(&mut map, edits);
        Ok(())
    }

    async fn snapshot(&self) -> Result<Snapshot, BackingStoreError> {
        Ok(self.lock()?.clone())
    }

    async fn clear(&self) -> Result<(), BackingStoreError> {
        self.lock()?.clear();
        Ok(())
    }
}
