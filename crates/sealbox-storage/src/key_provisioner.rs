use std::{collections::BTreeSet, sync::Arc};

use rand::{rngs::OsRng, RngCore};
use sealbox_core::storage::{AccessPolicy, SecureKeyError, SecureKeyStore};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::settings::StorageSettings;

/// Key material used for encryption at rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Key id the material belongs to (never log key bytes).
    pub key_id: String,
    /// 256-bit symmetric key.
    pub bytes: [u8; 32],
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("secure key facility: {0}")]
    Facility(#[from] SecureKeyError),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Per-key-id provisioning of symmetric keys in the secure key facility.
///
/// Each key id maps to the account `key_prefix + key_id` under one service.
/// `get_or_create` is a check-then-set sequence with no lock around it: two
/// first writers of the same unseen key id can both generate a key, and which
/// one survives is up to the facility. A loser's ciphertext then fails to
/// decrypt and reads degrade to the default.
pub struct KeyProvisioner<S: SecureKeyStore> {
    store: Arc<S>,
    service: String,
    prefix: String,
}

impl<S: SecureKeyStore> KeyProvisioner<S> {
    pub fn new(store: Arc<S>, settings: &StorageSettings) -> Self {
        Self {
            store,
            service: settings.service.clone(),
            prefix: settings.key_prefix.clone(),
        }
    }

    fn account(&self, key_id: &str) -> String {
        format!("{}{}", self.prefix, key_id)
    }

    /// Existing key for `key_id`, without provisioning one.
    #[instrument(skip_all, fields(key_id = %key_id))]
    pub async fn get(&self, key_id: &str) -> Result<Option<KeyMaterial>, KeyError> {
        match self.store.get(&self.service, &self.account(key_id)).await? {
            Some(secret) => decode_key(key_id, &secret).map(Some),
            None => Ok(None),
        }
    }

    /// Existing key for `key_id`, or a freshly generated one stored with the
    /// unlocked-device-only policy.
    #[instrument(skip_all, fields(key_id = %key_id))]
    pub async fn get_or_create(&self, key_id: &str) -> Result<KeyMaterial, KeyError> {
        if let Some(existing) = self.get(key_id).await? {
            return Ok(existing);
        }

        let material = generate_key(key_id);
        self.store
            .set(
                &self.service,
                &self.account(key_id),
                &material.bytes,
                AccessPolicy::WhenUnlockedThisDeviceOnly,
            )
            .await?;
        debug!("provisioned new key");
        Ok(material)
    }

    /// Remove the key for `key_id`; absence is not an error.
    #[instrument(skip_all, fields(key_id = %key_id))]
    pub async fn delete(&self, key_id: &str) -> Result<(), KeyError> {
        self.store
            .delete(&self.service, &self.account(key_id))
            .await?;
        Ok(())
    }

    /// Key ids of every key this provisioner manages. Accounts under the
    /// service that lack the prefix belong to someone else and are skipped.
    pub async fn list_accounts(&self) -> Result<BTreeSet<String>, KeyError> {
        let accounts = self.store.enumerate(&self.service).await?;
        Ok(accounts
            .into_iter()
            .filter_map(|account| account.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}

fn generate_key(key_id: &str) -> KeyMaterial {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    KeyMaterial {
        key_id: key_id.to_string(),
        bytes,
    }
}

fn decode_key(key_id: &str, secret: &[u8]) -> Result<KeyMaterial, KeyError> {
    let bytes: [u8; 32] = secret.try_into().map_err(|_| {
        KeyError::Decode(format!("expected 32 bytes, got {}", secret.len()))
    })?;
    Ok(KeyMaterial {
        key_id: key_id.to_string(),
        bytes,
    })
}
