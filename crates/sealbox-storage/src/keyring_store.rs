use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use keyring::Entry;
use sealbox_core::storage::{AccessPolicy, SecureKeyError, SecureKeyStore};
use tracing::debug;
#[cfg(target_os = "windows")]
use tracing::warn;

/// Account under each service that lists every account this adapter wrote.
const INDEX_ACCOUNT: &str = "__sealbox_index__";

/// OS keychain-backed secure key store using the `keyring` crate.
///
/// Keychains have no portable enumeration, so the adapter keeps its own index
/// credential per service. Keychain calls are synchronous and run on the
/// blocking thread pool.
///
/// Entries persist across restarts on every enabled backend: the macOS
/// keychain, the Windows credential manager, and on Linux the Secret Service
/// with the kernel keyring as a session cache. Only the macOS backend keeps
/// items on this device. Windows credentials roam with the user profile and
/// Secret Service collections can be synced by the desktop, so
/// [`AccessPolicy::WhenUnlockedThisDeviceOnly`] is not enforced there.
#[derive(Debug, Default, Clone)]
pub struct KeyringKeyStore {
    index_lock: Arc<Mutex<()>>,
}

impl KeyringKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureKeyStore for KeyringKeyStore {
    async fn set(
        &self,
        service: &str,
        account: &str,
        secret: &[u8],
        policy: AccessPolicy,
    ) -> Result<(), SecureKeyError> {
        debug!(?policy, "writing keychain item");
        #[cfg(target_os = "windows")]
        warn!(?policy, "windows credentials roam with the user profile; device-only policy not enforced");
        let (service, account, secret) = (service.to_string(), account.to_string(), secret.to_vec());
        let lock = self.index_lock.clone();
        blocking(move || {
            let _guard = lock.lock().map_err(poisoned)?;
            entry(&service, &account)?
                .set_secret(&secret)
                .map_err(denied)?;
            let mut index = read_index(&service)?;
            if index.insert(account) {
                write_index(&service, &index)?;
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, service: &str, account: &str) -> Result<Option<Vec<u8>>, SecureKeyError> {
        let (service, account) = (service.to_string(), account.to_string());
        blocking(move || missing_as_none(entry(&service, &account)?.get_secret())).await
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecureKeyError> {
        let (service, account) = (service.to_string(), account.to_string());
        let lock = self.index_lock.clone();
        blocking(move || {
            let _guard = lock.lock().map_err(poisoned)?;
            match entry(&service, &account)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(err) => return Err(denied(err)),
            }
            let mut index = read_index(&service)?;
            if index.remove(&account) {
                write_index(&service, &index)?;
            }
            Ok(())
        })
        .await
    }

    async fn enumerate(&self, service: &str) -> Result<Vec<String>, SecureKeyError> {
        let service = service.to_string();
        blocking(move || Ok(read_index(&service)?.into_iter().collect())).await
    }
}

async fn blocking<T, F>(work: F) -> Result<T, SecureKeyError>
where
    F: FnOnce() -> Result<T, SecureKeyError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SecureKeyError::Unavailable {
            reason: format!("keychain task failed: {e}"),
        })?
}

fn entry(service: &str, account: &str) -> Result<Entry, SecureKeyError> {
    Entry::new(service, account).map_err(unavailable)
}

fn read_index(service: &str) -> Result<BTreeSet<String>, SecureKeyError> {
    match missing_as_none(entry(service, INDEX_ACCOUNT)?.get_secret())? {
        Some(bytes) => decode_index(&bytes),
        None => Ok(BTreeSet::new()),
    }
}

fn write_index(service: &str, index: &BTreeSet<String>) -> Result<(), SecureKeyError> {
    let bytes = encode_index(index)?;
    entry(service, INDEX_ACCOUNT)?
        .set_secret(&bytes)
        .map_err(denied)
}

fn missing_as_none(result: keyring::Result<Vec<u8>>) -> Result<Option<Vec<u8>>, SecureKeyError> {
    match result {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(unavailable(err)),
    }
}

fn decode_index(bytes: &[u8]) -> Result<BTreeSet<String>, SecureKeyError> {
    serde_json::from_slice(bytes).map_err(|e| SecureKeyError::Unavailable {
        reason: format!("corrupt keychain index: {e}"),
    })
}

fn encode_index(index: &BTreeSet<String>) -> Result<Vec<u8>, SecureKeyError> {
    serde_json::to_vec(index).map_err(|e| SecureKeyError::Denied {
        reason: e.to_string(),
    })
}

fn unavailable(err: keyring::Error) -> SecureKeyError {
    SecureKeyError::Unavailable {
        reason: err.to_string(),
    }
}

fn denied(err: keyring::Error) -> SecureKeyError {
    SecureKeyError::Denied {
        reason: err.to_string(),
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> SecureKeyError {
    SecureKeyError::Unavailable {
        reason: format!("lock poisoned: {err}"),
    }
}
