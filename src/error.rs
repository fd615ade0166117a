//! Service-level error taxonomy.
//!
//! Authorization and validation failures are never retried automatically;
//! infrastructure errors are retryable. Error messages carry enough context
//! to act on (which ref was denied, which limit was hit) and never echo
//! secret plaintext.

use thiserror::Error;

use crate::audit::AuditError;
use crate::storage::StoreError;
use crate::vault::VaultError;

/// Errors surfaced at the service boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// A grant check failed for a requested secret reference.
    #[error("authorization denied for secret {secret_id}: {reason}")]
    Authorization {
        /// The denied secret reference.
        secret_id: String,
        /// Why the evaluator said no.
        reason: String,
    },
    /// Malformed command spec or secret reference; no job was created.
    #[error("invalid request: {0}")]
    Validation(String),
    /// A per-requester or global limit was exceeded; request rejected,
    /// not queued.
    #[error("{what} limit exceeded (limit {limit})")]
    LimitExceeded {
        /// Which limit was hit.
        what: String,
        /// The configured bound.
        limit: usize,
    },
    /// The referenced entity does not exist or is not visible to the caller.
    #[error("not found: {0}")]
    NotFound(String),
    /// Sandbox execution failed; the job reached a terminal state.
    #[error("sandbox failure: {0}")]
    Sandbox(String),
    /// Vault, store, or audit sink unavailable. Fail-closed and retryable.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl From<VaultError> for Error {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Denied { secret_id, reason } => Self::Authorization {
                secret_id: secret_id.to_string(),
                reason,
            },
            VaultError::NotFound(id) => Self::NotFound(format!("secret {id}")),
            VaultError::Validation(msg) => Self::Validation(msg),
            VaultError::Crypto(msg) => Self::Infrastructure(format!("crypto: {msg}")),
            VaultError::Store(e) => Self::Infrastructure(format!("store: {e}")),
            VaultError::Audit(e) => Self::Infrastructure(format!("audit: {e}")),
            VaultError::Key(e) => Self::Infrastructure(format!("key manager: {e}")),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Self::Infrastructure(format!("store: {err}"))
    }
}

impl From<AuditError> for Error {
    fn from(err: AuditError) -> Self {
        Self::Infrastructure(format!("audit: {err}"))
    }
}

impl Error {
    /// Whether a caller may retry this operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}
