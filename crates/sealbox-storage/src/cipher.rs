//! AES-256-GCM framing for encrypted payloads.
//!
//! A payload is `base64(nonce || ciphertext || tag)` with a fresh 96-bit
//! nonce drawn from the OS RNG on every seal.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::key_provisioner::KeyMaterial;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("cipher init failed: {0}")]
    Init(String),
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Encrypt `plaintext` and return the base64 payload.
pub fn seal(material: &KeyMaterial, plaintext: &[u8]) -> Result<String, CipherError> {
    let cipher = build_cipher(material)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CipherError::Encrypt(e.to_string()))?;

    let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    framed.extend_from_slice(nonce.as_slice());
    framed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(framed))
}

/// Decode and decrypt a payload produced by [`seal`]. Fails as a whole on a
/// wrong key or any tampering.
pub fn open(material: &KeyMaterial, payload: &str) -> Result<Vec<u8>, CipherError> {
    let framed = STANDARD
        .decode(payload)
        .map_err(|e| CipherError::Malformed(format!("base64: {e}")))?;
    if framed.len() < NONCE_LEN {
        return Err(CipherError::Malformed(format!(
            "expected at least {NONCE_LEN} bytes, got {}",
            framed.len()
        )));
    }

    let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
    let cipher = build_cipher(material)?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CipherError::Decrypt(e.to_string()))
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, CipherError> {
    Aes256Gcm::new_from_slice(&material.bytes).map_err(|e| CipherError::Init(e.to_string()))
}
