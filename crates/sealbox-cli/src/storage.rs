use std::path::PathBuf;

use crate::config::Config;
use color_eyre::Result;
use dirs::data_dir;
use sealbox_storage::{
    file_backing_store::FileBackingStore, keyring_store::KeyringKeyStore, SecureStorage,
};
use tracing::debug;

const STORE_FILE: &str = "store.json";

/// Facade wired to the on-disk backing store and the OS keychain.
pub type AppStorage = SecureStorage<FileBackingStore, KeyringKeyStore>;

/// Resolve the default data directory for Sealbox.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("sealbox"))
}

/// Build the storage facade, honoring a configured data directory.
pub fn storage_from_config(config: &Config) -> Result<AppStorage> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, service = %config.storage.service, "initializing storage");
    Ok(SecureStorage::new(
        FileBackingStore::new(root.join(STORE_FILE)),
        KeyringKeyStore::new(),
        config.storage.clone(),
    ))
}

/// Helper for tests: file-backed store under `root` with in-memory keys.
#[cfg(test)]
pub fn test_storage(
    root: impl Into<PathBuf>,
) -> SecureStorage<FileBackingStore, sealbox_core::storage::InMemorySecureKeyStore> {
    SecureStorage::new(
        FileBackingStore::new(root.into().join(STORE_FILE)),
        sealbox_core::storage::InMemorySecureKeyStore::new(),
        sealbox_storage::StorageSettings::default(),
    )
}
