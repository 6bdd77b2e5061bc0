//! Core abstractions for Sealbox: backing-store and secure-key contracts,
//! plus the typed codec shared by the encrypted and plain storage paths.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod codec;
pub mod storage;
