//! Public entry point routing each call to the encrypted or plain path.

use std::sync::Arc;

use sealbox_core::{
    codec::StorageValue,
    storage::{BackingStore, SecureKeyStore},
};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::oneshot,
};
use tracing::error;

use crate::{
    encrypted_store::EncryptedStore,
    error::StorageError,
    key_provisioner::KeyProvisioner,
    reaper::{OrphanReaper, ReapPass, ReapReport},
    settings::StorageSettings,
    unencrypted_store::UnencryptedStore,
};

struct Inner<B: BackingStore, S: SecureKeyStore> {
    encrypted: EncryptedStore<B, S>,
    plain: UnencryptedStore<B>,
    reaper: OrphanReaper<B, S>,
}

/// Typed key-value storage with optional per-key encryption.
///
/// Every operation first waits for the process's one orphan-key reclamation
/// pass for the configured service; instances built with the same service
/// share it. Cloning is cheap.
pub struct SecureStorage<B: BackingStore + 'static, S: SecureKeyStore + 'static> {
    inner: Arc<Inner<B, S>>,
    runtime: Option<Handle>,
}

impl<B: BackingStore + 'static, S: SecureKeyStore + 'static> Clone for SecureStorage<B, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            runtime: self.runtime.clone(),
        }
    }
}

impl<B: BackingStore + 'static, S: SecureKeyStore + 'static> SecureStorage<B, S> {
    /// Build a facade over the two facilities. Background and blocking work
    /// is scheduled on the tokio runtime current at construction, if any.
    pub fn new(backing: B, keys: S, settings: StorageSettings) -> Self {
        let backing = Arc::new(backing);
        let provisioner = Arc::new(KeyProvisioner::new(Arc::new(keys), &settings));
        let inner = Inner {
            encrypted: EncryptedStore::new(backing.clone(), provisioner.clone()),
            plain: UnencryptedStore::new(backing.clone()),
            reaper: OrphanReaper::new(
                backing,
                provisioner,
                settings.installation_marker,
                ReapPass::for_service(&settings.service),
            ),
        };
        Self {
            inner: Arc::new(inner),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Schedule background and blocking work on `handle`. [`get_blocking`]
    /// needs a multi-thread runtime here.
    ///
    /// [`get_blocking`]: Self::get_blocking
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Stored value, or `default` if it is absent or cannot be decrypted or
    /// decoded as `T`.
    pub async fn get<T: StorageValue>(&self, key: &str, default: T, encrypted: bool) -> T {
        self.inner.reaper.run_once().await;
        if encrypted {
            self.inner.encrypted.get(key, default).await
        } else {
            self.inner.plain.get(key, default).await
        }
    }

    pub async fn put<T: StorageValue>(
        &self,
        key: &str,
        value: &T,
        encrypted: bool,
    ) -> Result<(), StorageError> {
        self.inner.reaper.run_once().await;
        if encrypted {
            self.inner.encrypted.put(key, value).await
        } else {
            self.inner.plain.put(key, value).await
        }
    }

    /// Remove both the plain and the encrypted entry for `key`, along with
    /// its secure key.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.reaper.run_once().await;
        self.inner.plain.delete(key).await?;
        self.inner.encrypted.delete(key).await
    }

    /// Remove every entry in the backing store and every managed secure key.
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        self.inner.reaper.run_once().await;
        self.inner.encrypted.clear_all().await
    }

    /// Report of the service's reclamation pass; `None` if it failed.
    pub async fn reap_report(&self) -> Option<ReapReport> {
        self.inner.reaper.run_once().await.cloned()
    }

    /// Blocking [`get`](Self::get) for synchronous callers.
    ///
    /// The read runs on the runtime handle while this thread waits, so it
    /// must not be called from inside an async runtime. The handle must
    /// belong to a multi-thread runtime: nothing would drive a
    /// current-thread runtime while this thread is parked.
    pub fn get_blocking<T>(&self, key: &str, default: T, encrypted: bool) -> Result<T, StorageError>
    where
        T: StorageValue + Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(StorageError::BlockingInAsyncContext);
        }
        let runtime = self.runtime.as_ref().ok_or(StorageError::NoRuntime)?;
        if runtime.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(StorageError::CurrentThreadRuntime);
        }

        let (tx, rx) = oneshot::channel();
        let storage = self.clone();
        let key = key.to_string();
        runtime.spawn(async move {
            let value = storage.get(&key, default, encrypted).await;
            let _ = tx.send(value);
        });
        rx.blocking_recv().map_err(|_| StorageError::TaskAborted)
    }

    /// Queue a [`put`](Self::put) and return immediately.
    ///
    /// There is no completion signal and no guarantee the write lands before
    /// the process exits; failures are only logged. Use `put` when the
    /// outcome matters. Errors only if there is no runtime to submit to.
    pub fn submit_put<T>(&self, key: &str, value: T, encrypted: bool) -> Result<(), StorageError>
    where
        T: StorageValue + Send + Sync + 'static,
    {
        let runtime = self.runtime.as_ref().ok_or(StorageError::NoRuntime)?;
        let storage = self.clone();
        let key = key.to_string();
        runtime.spawn(async move {
            if let Err(err) = storage.put(&key, &value, encrypted).await {
                error!(key = %key, "background put failed: {err}");
            }
        });
        Ok(())
    }

    /// Queue a [`delete`](Self::delete) and return immediately, with the same
    /// caveats as [`submit_put`](Self::submit_put).
    pub fn submit_delete(&self, key: &str) -> Result<(), StorageError> {
        let runtime = self.runtime.as_ref().ok_or(StorageError::NoRuntime)?;
        let storage = self.clone();
        let key = key.to_string();
        runtime.spawn(async move {
            if let Err(err) = storage.delete(&key).await {
                error!(key = %key, "background delete failed: {err}");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use sealbox_core::{
        codec::Structured,
        storage::{
            AccessPolicy, InMemoryBackingStore, InMemorySecureKeyStore, SecureKeyError,
            StoredValue,
        },
    };
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::key_provisioner::KeyError;

    type MemoryStorage = SecureStorage<InMemoryBackingStore, InMemorySecureKeyStore>;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        theme: String,
        font_size: u32,
    }

    /// Key store whose operations can be made to fail on demand.
    #[derive(Debug, Clone, Default)]
    struct FlakyKeyStore {
        inner: InMemorySecureKeyStore,
        state: Arc<FlakyState>,
    }

    #[derive(Debug, Default)]
    struct FlakyState {
        fail_set: AtomicBool,
        fail_delete: AtomicBool,
        fail_enumerate: AtomicBool,
        enumerations: AtomicUsize,
    }

    impl FlakyKeyStore {
        fn check(flag: &AtomicBool) -> Result<(), SecureKeyError> {
            if flag.load(Ordering::SeqCst) {
                return Err(SecureKeyError::Denied {
                    reason: "keychain locked".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SecureKeyStore for FlakyKeyStore {
        async fn set(
            &self,
            service: &str,
            account: &str,
            secret: &[u8],
            policy: AccessPolicy,
        ) -> Result<(), SecureKeyError> {
            Self::check(&self.state.fail_set)?;
            self.inner.set(service, account, secret, policy).await
        }

        async fn get(&self, service: &str, account: &str) -> Result<Option<Vec<u8>>, SecureKeyError> {
            self.inner.get(service, account).await
        }

        async fn delete(&self, service: &str, account: &str) -> Result<(), SecureKeyError> {
            Self::check(&self.state.fail_delete)?;
            self.inner.delete(service, account).await
        }

        async fn enumerate(&self, service: &str) -> Result<Vec<String>, SecureKeyError> {
            self.state.enumerations.fetch_add(1, Ordering::SeqCst);
            Self::check(&self.state.fail_enumerate)?;
            self.inner.enumerate(service).await
        }
    }

    /// Settings under a service name of the test's own, since reclamation
    /// passes are shared per service across the test binary.
    fn settings(service: &str) -> StorageSettings {
        StorageSettings {
            service: service.into(),
            ..StorageSettings::default()
        }
    }

    fn storage(service: &str) -> (InMemoryBackingStore, InMemorySecureKeyStore, MemoryStorage) {
        let backing = InMemoryBackingStore::new();
        let keys = InMemorySecureKeyStore::new();
        let storage = SecureStorage::new(backing.clone(), keys.clone(), settings(service));
        (backing, keys, storage)
    }

    fn flaky_storage(
        service: &str,
    ) -> (
        InMemoryBackingStore,
        FlakyKeyStore,
        SecureStorage<InMemoryBackingStore, FlakyKeyStore>,
    ) {
        let backing = InMemoryBackingStore::new();
        let keys = FlakyKeyStore::default();
        let storage = SecureStorage::new(backing.clone(), keys.clone(), settings(service));
        (backing, keys, storage)
    }

    fn is_denied(err: &StorageError) -> bool {
        matches!(
            err,
            StorageError::Key(KeyError::Facility(SecureKeyError::Denied { .. }))
        )
    }

    async fn assert_plain_round_trip<T>(storage: &MemoryStorage, key: &str, value: T, default: T)
    where
        T: StorageValue + PartialEq + std::fmt::Debug + Clone,
    {
        storage.put(key, &value, false).await.expect("put");
        assert_eq!(storage.get(key, default, false).await, value, "key {key}");
    }

    async fn yield_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn plain_round_trip_at_boundaries() {
        let (_, _, storage) = storage("facade-plain");
        assert_plain_round_trip(&storage, "b", true, false).await;
        assert_plain_round_trip(&storage, "b", false, true).await;
        assert_plain_round_trip(&storage, "i32", i32::MIN, 0).await;
        assert_plain_round_trip(&storage, "i32", i32::MAX, 0).await;
        assert_plain_round_trip(&storage, "i32", 0, 1).await;
        assert_plain_round_trip(&storage, "i64", i64::MIN, 0).await;
        assert_plain_round_trip(&storage, "i64", i64::MAX, 0).await;
        assert_plain_round_trip(&storage, "i64", 0, 1).await;
        assert_plain_round_trip(&storage, "f32", -1.5f32, 0.0).await;
        assert_plain_round_trip(&storage, "f32", 0.0f32, 1.0).await;
        assert_plain_round_trip(&storage, "f64", -1.0e-300f64, 0.0).await;
        assert_plain_round_trip(&storage, "f64", f64::MAX, 0.0).await;
        assert_plain_round_trip(&storage, "s", String::new(), "default".to_string()).await;
        assert_plain_round_trip(&storage, "s", "héllo".to_string(), String::new()).await;
    }

    #[tokio::test]
    async fn encrypted_round_trip_for_primitive_and_structured_values() {
        let (_, _, storage) = storage("facade-encrypted");
        storage.put("pin", &4821i32, true).await.expect("put");
        storage.put("big", &i64::MIN, true).await.expect("put");
        storage.put("ratio", &-0.25f64, true).await.expect("put");
        let prefs = Prefs {
            theme: "dark".into(),
            font_size: 14,
        };
        storage
            .put("prefs", &Structured(prefs.clone()), true)
            .await
            .expect("put");

        assert_eq!(storage.get("pin", 0i32, true).await, 4821);
        assert_eq!(storage.get("big", 0i64, true).await, i64::MIN);
        assert_eq!(storage.get("ratio", 0.0f64, true).await, -0.25);
        assert_eq!(
            storage
                .get("prefs", Structured(Prefs::default()), true)
                .await
                .into_inner(),
            prefs
        );
    }

    #[tokio::test]
    async fn encrypted_miss_has_no_side_effect() {
        let (_, keys, storage) = storage("facade-miss");
        let before = keys.enumerate("facade-miss").await.unwrap();

        assert_eq!(
            storage.get("never-written", "fallback".to_string(), true).await,
            "fallback"
        );
        assert_eq!(keys.enumerate("facade-miss").await.unwrap(), before);
    }

    #[tokio::test]
    async fn delete_retires_key_material() {
        let (_, keys, storage) = storage("facade-delete");
        storage.put("k", &"v1".to_string(), true).await.expect("put");
        let first_key = keys.secret("facade-delete", "sealbox_key_k").expect("key exists");

        storage.delete("k").await.expect("delete");
        assert_eq!(keys.secret("facade-delete", "sealbox_key_k"), None);

        storage.put("k", &"v2".to_string(), true).await.expect("put");
        assert_eq!(storage.get("k", String::new(), true).await, "v2");
        let second_key = keys.secret("facade-delete", "sealbox_key_k").expect("key exists");
        assert_ne!(first_key, second_key);
    }

    #[tokio::test]
    async fn first_operation_reclaims_orphaned_keys() {
        let backing = InMemoryBackingStore::new();
        let keys = InMemorySecureKeyStore::new();
        for id in ["A", "B", "C"] {
            keys.set(
                "facade-reap",
                &format!("sealbox_key_{id}"),
                &[9u8; 32],
                AccessPolicy::WhenUnlockedThisDeviceOnly,
            )
            .await
            .unwrap();
        }
        backing
            .put("encrypted_A", StoredValue::String("opaque".into()))
            .await
            .unwrap();
        let storage = SecureStorage::new(backing, keys.clone(), settings("facade-reap"));

        assert_eq!(storage.get("unrelated", 0i32, false).await, 0);

        assert_eq!(
            keys.enumerate("facade-reap").await.unwrap(),
            vec!["sealbox_key_A".to_string()]
        );
        let report = storage.reap_report().await.expect("pass succeeded");
        assert_eq!(report.reclaimed, vec!["B".to_string(), "C".to_string()]);
    }

    #[tokio::test]
    async fn instances_for_one_service_share_a_single_pass() {
        let keys = FlakyKeyStore::default();
        let first = SecureStorage::new(
            InMemoryBackingStore::new(),
            keys.clone(),
            settings("facade-shared-pass"),
        );
        let second = SecureStorage::new(
            InMemoryBackingStore::new(),
            keys.clone(),
            settings("facade-shared-pass"),
        );

        assert_eq!(first.get("k", 0i32, false).await, 0);
        assert_eq!(second.get("k", 0i32, false).await, 0);

        assert_eq!(keys.state.enumerations.load(Ordering::SeqCst), 1);
        assert_eq!(first.reap_report().await, second.reap_report().await);
    }

    #[tokio::test]
    async fn tampered_ciphertext_degrades_to_default() {
        let (backing, _, storage) = storage("facade-tamper");
        storage.put("K", &"secret".to_string(), true).await.expect("put");
        storage.put("other", &"intact".to_string(), true).await.expect("put");
        storage.put("plain", &5i32, false).await.expect("put");

        let Some(StoredValue::String(payload)) = backing.get("encrypted_K").await.unwrap() else {
            panic!("missing payload");
        };
        let mut framed = STANDARD.decode(payload).unwrap();
        framed[12] ^= 0x40;
        backing
            .put("encrypted_K", StoredValue::String(STANDARD.encode(framed)))
            .await
            .unwrap();

        assert_eq!(storage.get("K", "default".to_string(), true).await, "default");
        assert_eq!(storage.get("other", String::new(), true).await, "intact");
        assert_eq!(storage.get("plain", 0i32, false).await, 5);
    }

    #[tokio::test]
    async fn clear_all_wipes_both_paths_and_keys() {
        let (_, keys, storage) = storage("facade-clear");
        storage.put("K1", &"enc".to_string(), true).await.expect("put");
        storage.put("K2", &"plain".to_string(), false).await.expect("put");

        storage.clear_all().await.expect("clear");

        assert_eq!(storage.get("K1", "d1".to_string(), true).await, "d1");
        assert_eq!(storage.get("K2", "d2".to_string(), false).await, "d2");
        assert!(keys.enumerate("facade-clear").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_covers_plain_entries() {
        let (backing, _, storage) = storage("facade-delete-plain");
        storage.put("k", &true, false).await.expect("put");
        storage.delete("k").await.expect("delete");
        assert_eq!(backing.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn encrypted_put_surfaces_key_store_failure() {
        let (backing, keys, storage) = flaky_storage("facade-put-denied");
        keys.state.fail_set.store(true, Ordering::SeqCst);

        let err = storage
            .put("token", &"secret".to_string(), true)
            .await
            .expect_err("key store refused");
        assert!(is_denied(&err), "unexpected error: {err}");
        assert_eq!(backing.get("encrypted_token").await.unwrap(), None);

        storage.put("plain", &1i32, false).await.expect("plain path unaffected");
    }

    #[tokio::test]
    async fn delete_surfaces_key_store_failure() {
        let (_, keys, storage) = flaky_storage("facade-delete-denied");
        storage.put("k", &"v".to_string(), true).await.expect("put");
        keys.state.fail_delete.store(true, Ordering::SeqCst);

        let err = storage.delete("k").await.expect_err("key store refused");
        assert!(is_denied(&err), "unexpected error: {err}");
        assert!(keys.inner.secret("facade-delete-denied", "sealbox_key_k").is_some());
    }

    #[tokio::test]
    async fn clear_all_surfaces_key_store_failure() {
        let (_, keys, storage) = flaky_storage("facade-clear-denied");
        storage.put("k", &"v".to_string(), true).await.expect("put");
        keys.state.fail_delete.store(true, Ordering::SeqCst);

        let err = storage.clear_all().await.expect_err("key store refused");
        assert!(is_denied(&err), "unexpected error: {err}");
        assert!(keys.inner.secret("facade-clear-denied", "sealbox_key_k").is_some());
    }

    #[tokio::test]
    async fn failed_reclamation_does_not_block_operations() {
        let (_, keys, storage) = flaky_storage("facade-reap-fails");
        keys.state.fail_enumerate.store(true, Ordering::SeqCst);

        storage.put("enc", &"v".to_string(), true).await.expect("put");
        storage.put("plain", &3i64, false).await.expect("put");

        assert_eq!(storage.get("enc", String::new(), true).await, "v");
        assert_eq!(storage.get("plain", 0i64, false).await, 3);
        assert_eq!(storage.reap_report().await, None);
        assert_eq!(keys.state.enumerations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submitted_writes_land_eventually() {
        let (_, _, storage) = storage("facade-submit");
        storage
            .submit_put("queued", "later".to_string(), true)
            .expect("submit");

        yield_until(|| {
            let storage = storage.clone();
            async move { storage.get("queued", String::new(), true).await == "later" }
        })
        .await;

        storage.submit_delete("queued").expect("submit");
        yield_until(|| {
            let storage = storage.clone();
            async move { storage.get("queued", String::new(), true).await.is_empty() }
        })
        .await;
    }

    #[test]
    fn submit_without_runtime_is_rejected() {
        let (_, _, storage) = storage("facade-no-runtime");
        let err = storage
            .submit_put("k", 1i32, false)
            .expect_err("no runtime");
        assert!(matches!(err, StorageError::NoRuntime));
    }

    #[test]
    fn blocking_get_runs_on_the_runtime() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let (_, _, storage) = storage("facade-blocking");
        let storage = storage.with_runtime(runtime.handle().clone());

        runtime
            .block_on(storage.put("answer", &42i64, true))
            .expect("put");

        let value = storage.get_blocking("answer", 0i64, true).expect("get");
        assert_eq!(value, 42);
        let missing = storage.get_blocking("missing", 7i64, true).expect("get");
        assert_eq!(missing, 7);
    }

    #[test]
    fn blocking_get_on_current_thread_runtime_is_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let (_, _, storage) = storage("facade-current-thread");
        let storage = storage.with_runtime(runtime.handle().clone());

        let err = storage
            .get_blocking("k", 0i32, false)
            .expect_err("nothing would drive the read");
        assert!(matches!(err, StorageError::CurrentThreadRuntime));
    }

    #[tokio::test]
    async fn blocking_get_inside_runtime_is_rejected() {
        let (_, _, storage) = storage("facade-in-runtime");
        let err = storage
            .get_blocking("k", 0i32, false)
            .expect_err("must refuse to block");
        assert!(matches!(err, StorageError::BlockingInAsyncContext));
    }
}
