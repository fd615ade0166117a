//! The key vault: encrypts, stores, and hands out secrets.
//!
//! `materialize` is the single read path that ever produces plaintext,
//! and its output is a job-scoped [`CredentialBundle`]. Every vault
//! operation appends one audit record synchronously before returning;
//! if the audit write fails the operation is aborted (fail-closed).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::access::{self, Decision};
use crate::audit::{AuditAction, AuditError, AuditLog, AuditOutcome, AuditRecord};
use crate::storage::{GrantRecord, SecretMeta, SecretRecord, Store, StoreError};
use crate::types::{Action, JobId, SecretId, SecretRef, Subject};

pub mod bundle;
pub mod crypto;
pub mod keys;

pub use bundle::{BundleEntry, CredentialBundle, SecretValue};

use crypto::CryptoError;
use keys::{KeyError, KeyManager};

/// Vault failures.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The secret does not exist.
    #[error("secret not found: {0}")]
    NotFound(SecretId),
    /// The evaluator denied the request.
    #[error("denied for secret {secret_id}: {reason}")]
    Denied {
        /// The secret the denial applies to.
        secret_id: SecretId,
        /// Caller-safe reason.
        reason: String,
    },
    /// Malformed input (name, actions, refs).
    #[error("invalid input: {0}")]
    Validation(String),
    /// Envelope encryption or decryption failed.
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
    /// Primary store unavailable.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Audit sink unavailable; the operation was aborted.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// Master key unavailable.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// The vault. Owns the encryption path and enforces per-secret grants
/// through the access evaluator on every materialize.
pub struct Vault {
    store: Arc<dyn Store>,
    keys: Arc<dyn KeyManager>,
    audit: Arc<AuditLog>,
    key_ref: String,
}

impl Vault {
    /// Build a vault over a store, a key-management capability, and the
    /// audit sink.
    pub fn new(
        store: Arc<dyn Store>,
        keys: Arc<dyn KeyManager>,
        audit: Arc<AuditLog>,
        key_ref: impl Into<String>,
    ) -> Self {
        Self {
            store,
            keys,
            audit,
            key_ref: key_ref.into(),
        }
    }

    /// Encrypt and store a secret for `owner`. Returns the new id.
    ///
    /// Plaintext is envelope-encrypted before anything is persisted;
    /// only ciphertext and the wrapped data key reach the store.
    pub async fn store(
        &self,
        owner: &Subject,
        name: &str,
        service: Option<&str>,
        plaintext: SecretValue,
    ) -> Result<SecretId, VaultError> {
        if name.is_empty() || name.len() > 128 {
            return Err(VaultError::Validation(format!(
                "secret name length must be 1-128, got {}",
                name.len()
            )));
        }

        let master = self.keys.master_key(&self.key_ref).await?;
        let envelope = crypto::encrypt_envelope(&master, plaintext.expose().as_bytes())?;
        drop(plaintext);

        let record = SecretRecord {
            id: SecretId::generate(),
            owner: owner.clone(),
            name: name.to_owned(),
            service: service.map(ToOwned::to_owned),
            envelope,
            key_ref: self.key_ref.clone(),
            created_at: Utc::now(),
            revoked_at: None,
        };
        let id = record.id;
        self.store.insert_secret(record).await?;

        if let Err(audit_err) = self.audit.append(&AuditRecord::now(
            owner.clone(),
            AuditAction::SecretStored,
            id.to_string(),
            AuditOutcome::Ok,
            serde_json::json!({ "name": name, "service": service }),
        )) {
            // Unaudited secrets must not exist; roll the insert back.
            if let Err(rollback_err) = self.store.delete_secret(id).await {
                warn!(secret = %id, error = %rollback_err, "failed to roll back unaudited secret");
            }
            return Err(audit_err.into());
        }

        info!(secret = %id, owner = %owner, "secret stored");
        Ok(id)
    }

    /// Grant `subject` the listed actions on a secret owned by `owner`.
    pub async fn grant(
        &self,
        owner: &Subject,
        secret_id: SecretId,
        subject: &Subject,
        actions: &[Action],
        ttl: Option<Duration>,
    ) -> Result<(), VaultError> {
        if actions.is_empty() {
            return Err(VaultError::Validation(
                "a grant must list at least one action".to_owned(),
            ));
        }
        let record = self
            .store
            .secret(secret_id)
            .await?
            .ok_or(VaultError::NotFound(secret_id))?;
        if &record.owner != owner {
            return Err(VaultError::Denied {
                secret_id,
                reason: "only the owner may grant access".to_owned(),
            });
        }
        if record.is_revoked() {
            return Err(VaultError::Denied {
                secret_id,
                reason: "secret is revoked".to_owned(),
            });
        }

        let expires_at = match ttl {
            Some(t) => {
                let delta = chrono::Duration::from_std(t)
                    .map_err(|e| VaultError::Validation(format!("invalid ttl: {e}")))?;
                let expiry = Utc::now()
                    .checked_add_signed(delta)
                    .ok_or_else(|| VaultError::Validation("ttl overflows the calendar".to_owned()))?;
                Some(expiry)
            }
            None => None,
        };
        let grant = GrantRecord {
            secret_id,
            subject: subject.clone(),
            actions: actions.to_vec(),
            expires_at,
            created_at: Utc::now(),
        };
        self.store.insert_grant(grant).await?;

        if let Err(audit_err) = self.audit.append(&AuditRecord::now(
            owner.clone(),
            AuditAction::GrantIssued,
            secret_id.to_string(),
            AuditOutcome::Ok,
            serde_json::json!({ "subject": subject, "actions": actions }),
        )) {
            // Fail-closed: drop the subject's grants on this secret
            // rather than leave an unaudited one active.
            if let Err(rollback_err) = self.store.delete_grants(secret_id, subject).await {
                warn!(secret = %secret_id, error = %rollback_err, "failed to roll back unaudited grant");
            }
            return Err(audit_err.into());
        }
        Ok(())
    }

    /// Delete all grants `subject` holds on a secret owned by `owner`.
    pub async fn revoke_grant(
        &self,
        owner: &Subject,
        secret_id: SecretId,
        subject: &Subject,
    ) -> Result<(), VaultError> {
        let record = self
            .store
            .secret(secret_id)
            .await?
            .ok_or(VaultError::NotFound(secret_id))?;
        if &record.owner != owner {
            return Err(VaultError::Denied {
                secret_id,
                reason: "only the owner may revoke grants".to_owned(),
            });
        }
        self.store.delete_grants(secret_id, subject).await?;

        // Grants are already gone; an audit failure still aborts the
        // call, and the deletion stands (the fail-closed direction).
        self.audit.append(&AuditRecord::now(
            owner.clone(),
            AuditAction::GrantRevoked,
            secret_id.to_string(),
            AuditOutcome::Ok,
            serde_json::json!({ "subject": subject }),
        ))?;
        Ok(())
    }

    /// Revoke a secret. Effective immediately for every future
    /// `materialize`; bundles already issued expire with their jobs.
    pub async fn revoke(&self, owner: &Subject, secret_id: SecretId) -> Result<(), VaultError> {
        let record = self
            .store
            .secret(secret_id)
            .await?
            .ok_or(VaultError::NotFound(secret_id))?;
        if &record.owner != owner {
            return Err(VaultError::Denied {
                secret_id,
                reason: "only the owner may revoke".to_owned(),
            });
        }
        self.store.revoke_secret(secret_id, Utc::now()).await?;

        // The revocation stands even if the audit append fails.
        self.audit.append(&AuditRecord::now(
            owner.clone(),
            AuditAction::SecretRevoked,
            secret_id.to_string(),
            AuditOutcome::Ok,
            serde_json::Value::Null,
        ))?;

        info!(secret = %secret_id, owner = %owner, "secret revoked");
        Ok(())
    }

    /// Metadata for all secrets owned by `owner`. Never returns
    /// ciphertext or plaintext.
    pub async fn list(&self, owner: &Subject) -> Result<Vec<SecretMeta>, VaultError> {
        Ok(self.store.list_secrets(owner).await?)
    }

    /// Materialize the requested refs into a bundle bound to `job_id`.
    ///
    /// All-or-nothing: every ref is authorized before anything is
    /// decrypted, and a single denial fails the whole call with no
    /// partial bundle. The single plaintext read path in the crate.
    pub async fn materialize(
        &self,
        job_id: JobId,
        requester: &Subject,
        refs: &[SecretRef],
    ) -> Result<CredentialBundle, VaultError> {
        // Authorize every ref against a per-secret consistent snapshot
        // before touching any ciphertext.
        let mut authorized = Vec::with_capacity(refs.len());
        for secret_ref in refs {
            let snapshot = self
                .store
                .secret_with_grants(secret_ref.secret_id, requester)
                .await?;
            let (record, grants) = match snapshot {
                Some(pair) => pair,
                None => {
                    return self
                        .deny(job_id, requester, secret_ref.secret_id, "secret does not exist")
                        .await;
                }
            };
            match access::evaluate_now(requester, Action::UseInJob, &record, &grants) {
                Decision::Allow => authorized.push((secret_ref.clone(), record)),
                Decision::Deny(reason) => {
                    return self
                        .deny(job_id, requester, secret_ref.secret_id, &reason)
                        .await;
                }
            }
        }

        let master = self.keys.master_key(&self.key_ref).await?;
        let mut entries = Vec::with_capacity(authorized.len());
        for (secret_ref, record) in &authorized {
            let plaintext = crypto::decrypt_envelope(&master, &record.envelope)?;
            let value = String::from_utf8(plaintext.to_vec())
                .map_err(|_| CryptoError::Malformed("secret is not valid UTF-8".to_owned()))?;
            entries.push(BundleEntry {
                env_name: secret_ref.env_name.clone(),
                value: SecretValue::new(value),
            });
        }
        let bundle = CredentialBundle::new(job_id, entries);

        let secret_ids: Vec<String> = refs.iter().map(|r| r.secret_id.to_string()).collect();
        if let Err(audit_err) = self.audit.append(&AuditRecord::now(
            requester.clone(),
            AuditAction::BundleMaterialized,
            job_id.to_string(),
            AuditOutcome::Ok,
            serde_json::json!({ "secrets": secret_ids }),
        )) {
            // Unaudited plaintext must not leave the vault.
            drop(bundle);
            return Err(audit_err.into());
        }

        info!(job = %job_id, requester = %requester, refs = refs.len(), "bundle materialized");
        Ok(bundle)
    }

    async fn deny(
        &self,
        job_id: JobId,
        requester: &Subject,
        secret_id: SecretId,
        reason: &str,
    ) -> Result<CredentialBundle, VaultError> {
        self.audit.append(&AuditRecord::now(
            requester.clone(),
            AuditAction::MaterializeDenied,
            secret_id.to_string(),
            AuditOutcome::Denied,
            serde_json::json!({ "job_id": job_id, "reason": reason }),
        ))?;
        warn!(job = %job_id, requester = %requester, secret = %secret_id, "materialize denied");
        Err(VaultError::Denied {
            secret_id,
            reason: reason.to_owned(),
        })
    }
}
