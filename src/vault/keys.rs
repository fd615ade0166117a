//! Master-key management boundary.
//!
//! The master key never lives in the primary datastore. The vault
//! receives a [`KeyManager`] capability at construction, so tests can
//! substitute a fake and production can point at a key file (or a real
//! KMS behind the same trait) without touching vault code.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Key-management failures.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The requested key reference is not served by this manager.
    #[error("unknown key reference: {0}")]
    UnknownRef(String),
    /// The key material could not be loaded.
    #[error("key unavailable: {0}")]
    Unavailable(String),
}

/// A 256-bit master key, zeroized on drop. No Debug impl exposes bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Raw key bytes, for cipher construction only.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(__REDACTED__)")
    }
}

/// The key-management boundary the vault depends on.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Resolve a key reference to the master key it names.
    async fn master_key(&self, key_ref: &str) -> Result<MasterKey, KeyError>;
}

/// Key manager serving a single fixed key (tests, ephemeral dev runs).
pub struct StaticKeyManager {
    key_ref: String,
    bytes: [u8; KEY_SIZE],
}

impl StaticKeyManager {
    /// Serve `bytes` under `key_ref`.
    pub fn new(key_ref: impl Into<String>, bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            key_ref: key_ref.into(),
            bytes,
        }
    }
}

impl Drop for StaticKeyManager {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

#[async_trait]
impl KeyManager for StaticKeyManager {
    async fn master_key(&self, key_ref: &str) -> Result<MasterKey, KeyError> {
        if key_ref != self.key_ref {
            return Err(KeyError::UnknownRef(key_ref.to_owned()));
        }
        Ok(MasterKey::from_bytes(self.bytes))
    }
}

/// Key manager reading a base64-encoded 32-byte key from a file outside
/// the primary datastore. The file is re-read per request so a rotated
/// key takes effect without a restart.
pub struct FileKeyManager {
    key_ref: String,
    path: PathBuf,
}

impl FileKeyManager {
    /// Serve the key at `path` under `key_ref`.
    pub fn new(key_ref: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            key_ref: key_ref.into(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl KeyManager for FileKeyManager {
    async fn master_key(&self, key_ref: &str) -> Result<MasterKey, KeyError> {
        if key_ref != self.key_ref {
            return Err(KeyError::UnknownRef(key_ref.to_owned()));
        }
        let encoded = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| KeyError::Unavailable(format!("{}: {e}", self.path.display())))?;
        let mut decoded = STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| KeyError::Unavailable(format!("invalid key encoding: {e}")))?;
        if decoded.len() != KEY_SIZE {
            decoded.zeroize();
            return Err(KeyError::Unavailable(format!(
                "master key must be {KEY_SIZE} bytes"
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(MasterKey::from_bytes(bytes))
    }
}
