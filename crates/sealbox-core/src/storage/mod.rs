//! Contracts for the two external collaborators: the durable key-value
//! backing store and the platform secure key facility.

mod backing_store;
mod secure_key_store;

pub use backing_store::{
    apply_edits, BackingStore, BackingStoreError, Edit, InMemoryBackingStore, Snapshot, StoredValue,
};
pub use secure_key_store::{AccessPolicy, InMemorySecureKeyStore, SecureKeyError, SecureKeyStore};
