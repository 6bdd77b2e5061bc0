use sealbox_core::{codec::CodecError, storage::BackingStoreError};
use thiserror::Error;

use crate::{cipher::CipherError, key_provisioner::KeyError};

/// Errors surfaced by the storage layer.
///
/// Reads never return these to callers; they collapse to the caller's
/// default. Writes, deletes and clears propagate them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Backing(#[from] BackingStoreError),
    #[error("key provisioning: {0}")]
    Key(#[from] KeyError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("no async runtime available to run storage work")]
    NoRuntime,
    #[error("blocking storage call needs a multi-thread runtime")]
    CurrentThreadRuntime,
    #[error("blocking storage call made from inside an async runtime")]
    BlockingInAsyncContext,
    #[error("storage task ended before completing")]
    TaskAborted,
}
