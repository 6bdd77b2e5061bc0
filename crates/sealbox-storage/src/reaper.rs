use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use sealbox_core::storage::{BackingStore, SecureKeyStore, StoredValue};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    encrypted_store::encrypted_key_ids, error::StorageError, key_provisioner::KeyProvisioner,
};

/// Outcome of one reclamation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Key ids with an encrypted payload in the backing store.
    pub valid_keys: usize,
    /// Key ids found in the secure key facility.
    pub secure_keys: usize,
    /// Key ids whose orphaned keys were deleted.
    pub reclaimed: Vec<String>,
}

/// Gate recording whether a reclamation pass has run. Failed passes count
/// as run and yield `None`.
#[derive(Debug, Default)]
pub struct ReapPass {
    outcome: OnceCell<Option<ReapReport>>,
}

static PROCESS_PASSES: OnceLock<Mutex<HashMap<String, Arc<ReapPass>>>> = OnceLock::new();

impl ReapPass {
    /// The gate shared by every reaper in this process that manages keys
    /// under `service`.
    pub fn for_service(service: &str) -> Arc<ReapPass> {
        let passes = PROCESS_PASSES.get_or_init(Default::default);
        // A poisoned map still holds valid gates.
        let mut passes = passes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        passes.entry(service.to_string()).or_default().clone()
    }
}

/// Deletes secure keys that no longer have a backing-store payload, which
/// happens when the backing store is wiped but the keychain survives.
///
/// `run_once` is single-flight on the reaper's [`ReapPass`]: the first caller
/// runs the pass and every concurrent caller waits on that same pass.
/// Reapers sharing a pass (see [`ReapPass::for_service`]) run it once between
/// them.
pub struct OrphanReaper<B: BackingStore, S: SecureKeyStore> {
    backing: Arc<B>,
    keys: Arc<KeyProvisioner<S>>,
    marker: String,
    pass: Arc<ReapPass>,
}

impl<B: BackingStore, S: SecureKeyStore> OrphanReaper<B, S> {
    pub fn new(
        backing: Arc<B>,
        keys: Arc<KeyProvisioner<S>>,
        marker: impl Into<String>,
        pass: Arc<ReapPass>,
    ) -> Self {
        Self {
            backing,
            keys,
            marker: marker.into(),
            pass,
        }
    }

    /// Run the pass unless it has already run; failures are logged and
    /// swallowed, yielding `None`.
    pub async fn run_once(&self) -> Option<&ReapReport> {
        self.pass
            .outcome
            .get_or_init(|| async {
                match self.reap().await {
                    Ok(report) => {
                        info!(
                            valid = report.valid_keys,
                            secure = report.secure_keys,
                            reclaimed = report.reclaimed.len(),
                            "orphan key reclamation finished"
                        );
                        Some(report)
                    }
                    Err(err) => {
                        warn!("orphan key reclamation failed: {err}");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    /// One unconditional reclamation pass.
    #[instrument(skip_all)]
    pub async fn reap(&self) -> Result<ReapReport, StorageError> {
        self.ensure_installation_marker().await?;

        let snapshot = self.backing.snapshot().await?;
        let valid = encrypted_key_ids(&snapshot);
        let secure = self.keys.list_accounts().await?;

        let mut reclaimed = Vec::new();
        for orphan in secure.difference(&valid) {
            match self.keys.delete(orphan).await {
                Ok(()) => reclaimed.push(orphan.clone()),
                Err(err) => warn!(key_id = %orphan, "failed to delete orphaned key: {err}"),
            }
        }

        Ok(ReapReport {
            valid_keys: valid.len(),
            secure_keys: secure.len(),
            reclaimed,
        })
    }

    async fn ensure_installation_marker(&self) -> Result<(), StorageError> {
        if self.backing.get(&self.marker).await?.is_some() {
            return Ok(());
        }
        let id = Uuid::new_v4().to_string();
        self.backing
            .put(&self.marker, StoredValue::String(id))
            .await?;
        debug!("created installation marker");
        Ok(())
    }
}
