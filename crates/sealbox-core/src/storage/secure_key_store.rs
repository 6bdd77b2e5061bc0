use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use thiserror::Error;

/// Availability rules attached to a stored secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Readable only while the device is unlocked; never synced off-device.
    #[default]
    WhenUnlockedThisDeviceOnly,
}

/// Errors produced by secure key facility implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecureKeyError {
    /// The facility could not be reached or refused to enumerate/query.
    #[error("secure key facility unavailable: {reason}")]
    Unavailable { reason: String },
    /// The facility rejected a write or delete.
    #[error("secure key facility denied the operation: {reason}")]
    Denied { reason: String },
}

/// Keyed secure storage scoped by `(service, account)`.
///
/// Implementations wrap a platform keychain/keystore. Nothing here is
/// transactional across calls: a `get` followed by a `set` may interleave
/// with another caller doing the same.
#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    /// Store `secret`, overwriting any existing entry.
    async fn set(
        &self,
        service: &str,
        account: &str,
        secret: &[u8],
        policy: AccessPolicy,
    ) -> Result<(), SecureKeyError>;

    /// Fetch a secret; `None` if no entry exists.
    async fn get(&self, service: &str, account: &str) -> Result<Option<Vec<u8>>, SecureKeyError>;

    /// Remove an entry (idempotent).
    async fn delete(&self, service: &str, account: &str) -> Result<(), SecureKeyError>;

    /// List every account stored under `service`.
    async fn enumerate(&self, service: &str) -> Result<Vec<String>, SecureKeyError>;
}

#[derive(Debug, Clone)]
struct Record {
    secret: Vec<u8>,
    policy: AccessPolicy,
}

/// In-memory secure key store for tests and smoke runs.
/// Secrets live in process memory only; production builds use the OS keychain.
#[derive(Debug, Default, Clone)]
pub struct InMemorySecureKeyStore {
    inner: Arc<Mutex<BTreeMap<(String, String), Record>>>,
}

impl InMemorySecureKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw secret for an entry, for assertions in tests.
    pub fn secret(&self, service: &str, account: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .ok()?
            .get(&(service.to_string(), account.to_string()))
            .map(|record| record.secret.clone())
    }

    /// Policy an entry was stored with.
    pub fn policy(&self, service: &str, account: &str) -> Option<AccessPolicy> {
        self.inner
            .lock()
            .ok()?
            .get(&(service.to_string(), account.to_string()))
            .map(|record| record.policy)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<(String, String), Record>>, SecureKeyError> {
        self.inner.lock().map_err(|err| SecureKeyError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl SecureKeyStore for InMemorySecureKeyStore {
    async fn set(
        &self,
        service: &str,
        account: &str,
        secret: &[u8],
        policy: AccessPolicy,
    ) -> Result<(), SecureKeyError> {
        self.lock()?.insert(
            (service.to_string(), account.to_string()),
            Record {
                secret: secret.to_vec(),
                policy,
            },
        );
        Ok(())
    }

    async fn get(&self, service: &str, account: &str) -> Result<Option<Vec<u8>>, SecureKeyError> {
        Ok(self
            .lock()?
            .get(&(service.to_string(), account.to_string()))
            .map(|record| record.secret.clone()))
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecureKeyError> {
        self.lock()?
            .remove(&(service.to_string(), account.to_string()));
        Ok(())
    }

    async fn enumerate(&self, service: &str) -> Result<Vec<String>, SecureKeyError> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(svc, _)| svc == service)
            .map(|(_, account)| account.clone())
            .collect())
    }
}
