//! Per-key encrypted storage over a backing key-value store.
//! Uses AES-GCM with one key per entry, held in the OS keychain (or test doubles).

pub mod cipher;
pub mod encrypted_store;
pub mod error;
pub mod facade;
pub mod file_backing_store;
pub mod key_provisioner;
pub mod keyring_store;
pub mod reaper;
pub mod settings;
pub mod unencrypted_store;

pub use error::StorageError;
pub use facade::SecureStorage;
pub use settings::StorageSettings;
