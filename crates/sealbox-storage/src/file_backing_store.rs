use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use sealbox_core::storage::{
    apply_edits, BackingStore, BackingStoreError, Edit, Snapshot, StoredValue,
};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Durable backing store keeping the whole mapping in a single JSON file.
///
/// Every transaction rewrites the file through a temp file and rename, so a
/// crash leaves either the old or the new mapping on disk. An async mutex
/// serializes transactions within the process.
pub struct FileBackingStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileBackingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn get(&self, name: &str) -> Result<Option<StoredValue>, BackingStoreError> {
        let _guard = self.guard.lock().await;
        Ok(read_map(&self.path)?.remove(name))
    }

    #[instrument(skip_all, fields(edits = edits.len()))]
    async fn edit(&self, edits: Vec<Edit>) -> Result<(), BackingStoreError> {
        let _guard = self.guard.lock().await;
        let mut map = read_map(&self.path)?;
        apply_edits(&mut map, edits);
        write_map(&self.path, &map)
    }

    async fn snapshot(&self) -> Result<Snapshot, BackingStoreError> {
        let _guard = self.guard.lock().await;
        read_map(&self.path)
    }

    #[instrument(skip_all)]
    async fn clear(&self) -> Result<(), BackingStoreError> {
        let _guard = self.guard.lock().await;
        write_map(&self.path, &Snapshot::new())?;
        debug!(path = ?self.path, "cleared backing store");
        Ok(())
    }
}

fn write_map(path: &Path, map: &Snapshot) -> Result<(), BackingStoreError> {
    let parent = path.parent().ok_or_else(|| BackingStoreError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec(map).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_map(path: &Path) -> Result<Snapshot, BackingStoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::new()),
        Err(err) => return Err(storage_err(err)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    serde_json::from_slice(&buf).map_err(storage_err)
}

fn storage_err<E: ToString>(err: E) -> BackingStoreError {
    BackingStoreError::Storage {
        reason: err.to_string(),
    }
}
