use serde::{Deserialize, Serialize};

/// Backing-store name prefix for encrypted payloads: `encrypted_<key_id>`.
pub const ENCRYPTED_PREFIX: &str = "encrypted_";

/// Names and scopes the storage layer uses in both facilities.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageSettings {
    /// Secure-key facility service that scopes every key this library owns.
    pub service: String,
    /// Prefix prepended to a key id to form its secure-key account.
    pub key_prefix: String,
    /// Backing-store entry holding the per-install identifier.
    pub installation_marker: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            service: "sealbox".to_string(),
            key_prefix: "sealbox_key_".to_string(),
            installation_marker: "sealbox_installation_id".to_string(),
        }
    }
}

pub fn encrypted_name(key_id: &str) -> String {
    format!("{ENCRYPTED_PREFIX}{key_id}")
}
