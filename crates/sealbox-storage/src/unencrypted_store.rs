use std::sync::Arc;

use sealbox_core::{codec::StorageValue, storage::BackingStore};
use tracing::{instrument, warn};

use crate::error::StorageError;

/// Values stored in their native backing-store form under the key itself.
pub struct UnencryptedStore<B: BackingStore> {
    backing: Arc<B>,
}

impl<B: BackingStore> UnencryptedStore<B> {
    pub fn new(backing: Arc<B>) -> Self {
        Self { backing }
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn put<T: StorageValue>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let stored = value.to_stored()?;
        self.backing.put(key, stored).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn get<T: StorageValue>(&self, key: &str, default: T) -> T {
        match self.backing.get(key).await {
            Ok(Some(stored)) => T::from_stored(stored).unwrap_or(default),
            Ok(None) => default,
            Err(err) => {
                warn!(descriptor = ?T::DESCRIPTOR, "plain read fell back to default: {err}");
                default
            }
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.backing.remove(key).await?;
        Ok(())
    }
}
