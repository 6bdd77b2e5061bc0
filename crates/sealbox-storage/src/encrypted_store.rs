use std::{collections::BTreeSet, sync::Arc};

use sealbox_core::{
    codec::StorageValue,
    storage::{BackingStore, SecureKeyStore, Snapshot, StoredValue},
};
use tracing::{debug, instrument, warn};

use crate::{
    cipher::{self, CipherError},
    error::StorageError,
    key_provisioner::KeyProvisioner,
    settings::{encrypted_name, ENCRYPTED_PREFIX},
};

/// AES-GCM encrypted values stored as base64 strings at `encrypted_<key>`.
/// Each key id gets its own symmetric key, provisioned on first write.
pub struct EncryptedStore<B: BackingStore, S: SecureKeyStore> {
    backing: Arc<B>,
    keys: Arc<KeyProvisioner<S>>,
}

impl<B: BackingStore, S: SecureKeyStore> EncryptedStore<B, S> {
    pub fn new(backing: Arc<B>, keys: Arc<KeyProvisioner<S>>) -> Self {
        Self { backing, keys }
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn put<T: StorageValue>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let plaintext = value.to_bytes()?;
        let material = self.keys.get_or_create(key).await?;
        let payload = cipher::seal(&material, &plaintext)?;
        self.backing
            .put(&encrypted_name(key), StoredValue::String(payload))
            .await?;
        Ok(())
    }

    /// Decrypted value, or `default` on a miss or on any failure along the way.
    ///
    /// Reads never provision keys. A payload whose key is gone is logged as
    /// unrecoverable and yields `default`; the payload stays in place until
    /// the next `put` overwrites it under a fresh key.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get<T: StorageValue>(&self, key: &str, default: T) -> T {
        match self.try_get::<T>(key).await {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(err) => {
                warn!(descriptor = ?T::DESCRIPTOR, "encrypted read fell back to default: {err}");
                default
            }
        }
    }

    async fn try_get<T: StorageValue>(&self, key: &str) -> Result<Option<T>, StorageError> {
        // Look up the payload first so a miss never touches the key facility.
        let Some(stored) = self.backing.get(&encrypted_name(key)).await? else {
            return Ok(None);
        };
        let StoredValue::String(payload) = stored else {
            return Err(CipherError::Malformed("payload is not a string".into()).into());
        };

        let Some(material) = self.keys.get(key).await? else {
            warn!("encrypted payload has no key material; stored value is unrecoverable");
            return Ok(None);
        };

        let plaintext = cipher::open(&material, &payload)?;
        let decoded = T::from_bytes(&plaintext);
        if decoded.is_none() {
            debug!(descriptor = ?T::DESCRIPTOR, "decrypted value does not decode as requested type");
        }
        Ok(decoded)
    }

    /// Remove payload and key together (idempotent).
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.backing.remove(&encrypted_name(key)).await?;
        self.keys.delete(key).await?;
        Ok(())
    }

    /// Wipe the whole backing store and every key this library manages.
    #[instrument(skip_all)]
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        let snapshot = self.backing.snapshot().await?;
        let key_ids = encrypted_key_ids(&snapshot);
        self.backing.clear().await?;

        for key_id in &key_ids {
            self.keys.delete(key_id).await?;
        }
        // Keys with no payload would otherwise survive until the next reap.
        for key_id in self.keys.list_accounts().await? {
            self.keys.delete(&key_id).await?;
        }
        debug!(cleared = key_ids.len(), "cleared encrypted entries");
        Ok(())
    }
}

/// Key ids that currently have an encrypted payload.
pub(crate) fn encrypted_key_ids(snapshot: &Snapshot) -> BTreeSet<String> {
    snapshot
        .keys()
        .filter_map(|name| name.strip_prefix(ENCRYPTED_PREFIX).map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use sealbox_core::{
        codec::Structured,
        storage::{InMemoryBackingStore, InMemorySecureKeyStore},
    };
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::settings::StorageSettings;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        scopes: Vec<String>,
    }

    fn store() -> (
        InMemoryBackingStore,
        InMemorySecureKeyStore,
        EncryptedStore<InMemoryBackingStore, InMemorySecureKeyStore>,
    ) {
        let backing = InMemoryBackingStore::new();
        let keys = InMemorySecureKeyStore::new();
        let provisioner = KeyProvisioner::new(Arc::new(keys.clone()), &StorageSettings::default());
        let store = EncryptedStore::new(Arc::new(backing.clone()), Arc::new(provisioner));
        (backing, keys, store)
    }

    #[tokio::test]
    async fn round_trip_encrypts_and_decrypts() {
        let (backing, _, store) = store();
        store
            .put("token", &"hello-sealbox".to_string())
            .await
            .expect("put");

        let value: String = store.get("token", String::new()).await;
        assert_eq!(value, "hello-sealbox");

        // ensure plaintext is not present in the backing store
        let stored = backing.get("encrypted_token").await.unwrap();
        let Some(StoredValue::String(payload)) = stored else {
            panic!("payload should be a string");
        };
        assert!(!payload.contains("hello-sealbox"), "plaintext must not be stored");
    }

    #[tokio::test]
    async fn structured_values_round_trip() {
        let (_, _, store) = store();
        let session = Session {
            user: "ada".into(),
            scopes: vec!["read".into(), "write".into()],
        };
        store
            .put("session", &Structured(session.clone()))
            .await
            .expect("put");

        let fallback = Structured(Session {
            user: String::new(),
            scopes: vec![],
        });
        assert_eq!(store.get("session", fallback).await.into_inner(), session);
    }

    #[tokio::test]
    async fn miss_returns_default_without_provisioning() {
        let (_, keys, store) = store();
        assert_eq!(store.get("absent", 17i32).await, 17);
        assert!(keys.enumerate("sealbox").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_key_returns_default_and_keeps_payload() {
        let (backing, keys, store) = store();
        store.put("pin", &1234i32).await.expect("put");
        keys.delete("sealbox", "sealbox_key_pin").await.unwrap();

        assert_eq!(store.get("pin", -1i32).await, -1);
        assert!(keys.enumerate("sealbox").await.unwrap().is_empty());
        assert!(backing.get("encrypted_pin").await.unwrap().is_some());

        store.put("pin", &4321i32).await.expect("put under a fresh key");
        assert_eq!(store.get("pin", -1i32).await, 4321);
    }

    #[tokio::test]
    async fn wrong_requested_type_returns_default() {
        let (_, _, store) = store();
        store.put("flag", &true).await.expect("put");
        assert_eq!(store.get("flag", 5i64).await, 5);
        assert!(store.get("flag", false).await);
    }

    #[tokio::test]
    async fn tampered_payload_returns_default_and_spares_other_keys() {
        let (backing, _, store) = store();
        store.put("victim", &99i64).await.expect("put");
        store.put("bystander", &7i64).await.expect("put");

        let Some(StoredValue::String(payload)) = backing.get("encrypted_victim").await.unwrap()
        else {
            panic!("missing payload");
        };
        let mut framed = STANDARD.decode(payload).unwrap();
        framed[14] ^= 0xFF;
        backing
            .put("encrypted_victim", StoredValue::String(STANDARD.encode(framed)))
            .await
            .unwrap();

        assert_eq!(store.get("victim", 0i64).await, 0);
        assert_eq!(store.get("bystander", 0i64).await, 7);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_key() {
        let (backing, keys, store) = store();
        store.put("k", &"v".to_string()).await.expect("put");
        store.delete("k").await.expect("delete");
        store.delete("k").await.expect("delete again");

        assert_eq!(backing.get("encrypted_k").await.unwrap(), None);
        assert_eq!(keys.secret("sealbox", "sealbox_key_k"), None);
    }

    #[tokio::test]
    async fn clear_all_removes_payloads_and_every_managed_key() {
        let (backing, keys, store) = store();
        store.put("a", &1i32).await.unwrap();
        backing
            .put("plain", StoredValue::Bool(true))
            .await
            .unwrap();
        // key with no payload
        keys.set(
            "sealbox",
            "sealbox_key_orphan",
            &[0u8; 32],
            Default::default(),
        )
        .await
        .unwrap();

        store.clear_all().await.expect("clear");

        assert!(backing.snapshot().await.unwrap().is_empty());
        assert!(keys.enumerate("sealbox").await.unwrap().is_empty());
    }
}
