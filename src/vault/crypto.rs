//! AES-256-GCM envelope encryption for vault secrets.
//!
//! Each secret gets its own random data key; the payload is encrypted
//! under the data key and the data key is wrapped under the master key
//! held by the [`KeyManager`](super::keys::KeyManager) boundary. Only
//! ciphertext and the wrapped data key are ever persisted.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use super::keys::{MasterKey, KEY_SIZE};

/// 12-byte nonce for AES-GCM (96 bits is the standard).
pub const NONCE_SIZE: usize = 12;

/// Crypto failures. Messages never include key or plaintext material.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Cipher construction or encryption failed.
    #[error("encryption failed: {0}")]
    Encrypt(String),
    /// Decryption or unwrap failed (wrong key, tampered ciphertext).
    #[error("decryption failed: {0}")]
    Decrypt(String),
    /// Persisted envelope material is malformed.
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Base64 (de)serialization for binary envelope fields, keeping the
/// persisted representation printable.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// The persisted envelope: payload ciphertext plus the wrapped data key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeCiphertext {
    /// Payload encrypted under the per-secret data key.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Nonce used for the payload encryption.
    #[serde(with = "b64")]
    pub payload_nonce: Vec<u8>,
    /// Data key encrypted under the master key.
    #[serde(with = "b64")]
    pub wrapped_key: Vec<u8>,
    /// Nonce used for the key wrap.
    #[serde(with = "b64")]
    pub key_nonce: Vec<u8>,
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let nonce_bytes = random_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    Ok((ciphertext, nonce_bytes))
}

fn open(
    key: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    nonce_bytes: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::Malformed(format!(
            "nonce size {} (expected {NONCE_SIZE})",
            nonce_bytes.len()
        )));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt plaintext under a fresh data key and wrap the data key under
/// the master key.
pub fn encrypt_envelope(
    master: &MasterKey,
    plaintext: &[u8],
) -> Result<EnvelopeCiphertext, CryptoError> {
    let mut data_key = Zeroizing::new([0u8; KEY_SIZE]);
    rand::thread_rng().fill_bytes(data_key.as_mut());

    let (ciphertext, payload_nonce) = seal(&data_key, plaintext)?;
    let (wrapped_key, key_nonce) = seal(master.as_bytes(), data_key.as_ref())?;

    Ok(EnvelopeCiphertext {
        ciphertext,
        payload_nonce: payload_nonce.to_vec(),
        wrapped_key,
        key_nonce: key_nonce.to_vec(),
    })
}

/// Unwrap the data key under the master key and decrypt the payload.
/// The returned buffer zeroizes on drop.
pub fn decrypt_envelope(
    master: &MasterKey,
    envelope: &EnvelopeCiphertext,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let data_key_bytes = open(master.as_bytes(), &envelope.wrapped_key, &envelope.key_nonce)?;
    if data_key_bytes.len() != KEY_SIZE {
        return Err(CryptoError::Malformed(format!(
            "wrapped key unwrapped to {} bytes",
            data_key_bytes.len()
        )));
    }
    let mut data_key = Zeroizing::new([0u8; KEY_SIZE]);
    data_key.copy_from_slice(&data_key_bytes);

    open(&data_key, &envelope.ciphertext, &envelope.payload_nonce)
}
