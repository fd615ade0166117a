//! Persistent records and the primary-store boundary.
//!
//! Secrets, grants, and jobs live in one transactional store behind the
//! [`Store`] trait. The audit log is deliberately *not* part of this
//! boundary; it has its own append-only sink so a primary-store
//! compromise cannot silently erase history.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    Action, CommandSpec, JobId, JobOutcome, JobState, OutputLine, SecretId, SecretRef, Subject,
    Timestamp,
};
use crate::vault::crypto::EnvelopeCiphertext;

pub mod memory;
pub mod sqlite;

/// Store failures. All variants are infrastructure-level; authorization
/// decisions are never made here.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or the query failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The requested write conflicts with current state
    /// (e.g. a transition out of a terminal job state).
    #[error("conflict: {0}")]
    Conflict(String),
    /// A persisted row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// A stored secret: ciphertext plus envelope material, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Secret id.
    pub id: SecretId,
    /// Owning subject. Owners implicitly hold all actions.
    pub owner: Subject,
    /// Human-readable name chosen by the owner (e.g. "npm-token").
    pub name: String,
    /// Optional service label (e.g. "npm").
    pub service: Option<String>,
    /// Envelope-encrypted payload and wrapped data key.
    pub envelope: EnvelopeCiphertext,
    /// Reference to the master key that wraps the data key.
    pub key_ref: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Soft-delete marker. Revoked secrets keep their ciphertext for
    /// audit but can never be materialized again.
    pub revoked_at: Option<Timestamp>,
}

impl SecretRecord {
    /// Whether the secret has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Metadata view with no cryptographic material.
    pub fn meta(&self) -> SecretMeta {
        SecretMeta {
            id: self.id,
            name: self.name.clone(),
            service: self.service.clone(),
            created_at: self.created_at,
            revoked_at: self.revoked_at,
        }
    }
}

/// Metadata-only view of a secret for listing. Carries neither
/// plaintext nor ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMeta {
    /// Secret id.
    pub id: SecretId,
    /// Owner-chosen name.
    pub name: String,
    /// Optional service label.
    pub service: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Revocation time, if revoked.
    pub revoked_at: Option<Timestamp>,
}

/// An authorization record: subject may perform the listed actions on
/// the secret until the grant expires or is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRecord {
    /// The secret this grant covers.
    pub secret_id: SecretId,
    /// The subject being granted access.
    pub subject: Subject,
    /// Permitted actions.
    pub actions: Vec<Action>,
    /// Optional expiry. Expired grants are never honored, even if
    /// still stored.
    pub expires_at: Option<Timestamp>,
    /// Issue time.
    pub created_at: Timestamp,
}

impl GrantRecord {
    /// Whether this grant permits `action` at time `now`.
    pub fn allows(&self, action: Action, now: Timestamp) -> bool {
        if let Some(expiry) = self.expires_at {
            if now >= expiry {
                return false;
            }
        }
        self.actions.contains(&action)
    }
}

/// One install job from request to terminal state. Owned exclusively
/// by the scheduler; immutable once terminal except for audit
/// annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,
    /// The authenticated subject that submitted the job.
    pub requester: Subject,
    /// The install command to run.
    pub spec: CommandSpec,
    /// Declared secret references the job needs.
    pub secret_refs: Vec<SecretRef>,
    /// Current lifecycle state.
    pub state: JobState,
    /// Submission time.
    pub created_at: Timestamp,
    /// Dispatch time.
    pub started_at: Option<Timestamp>,
    /// Terminal time.
    pub finished_at: Option<Timestamp>,
    /// Terminal outcome detail.
    pub outcome: Option<JobOutcome>,
    /// Redacted sandbox output collected during the run.
    pub output: Vec<OutputLine>,
    /// Post-terminal audit annotations. The only field that may change
    /// after the job reaches a terminal state.
    pub annotations: Vec<String>,
}

impl JobRecord {
    /// Create a freshly queued job.
    pub fn queued(requester: Subject, spec: CommandSpec, secret_refs: Vec<SecretRef>) -> Self {
        Self {
            id: JobId::generate(),
            requester,
            spec,
            secret_refs,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outcome: None,
            output: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// Transition Queued → Running.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the job is not queued.
    pub fn mark_running(&mut self) -> Result<(), StoreError> {
        if self.state != JobState::Queued {
            return Err(StoreError::Conflict(format!(
                "job {} cannot start from state {:?}",
                self.id, self.state
            )));
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Transition into a terminal state. Terminal states are final:
    /// a second completion is a conflict, never a state change.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the job is already terminal.
    pub fn complete(&mut self, outcome: JobOutcome) -> Result<(), StoreError> {
        if self.state.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "job {} is already terminal ({:?})",
                self.id, self.state
            )));
        }
        self.state = outcome.state();
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// The transactional primary store for secrets, grants, and jobs.
///
/// `secret_with_grants` must return one consistent snapshot per call so
/// a revoke can never race a materialize into an inconsistent
/// authorization decision.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new secret.
    async fn insert_secret(&self, record: SecretRecord) -> Result<(), StoreError>;

    /// Fetch a secret by id.
    async fn secret(&self, id: SecretId) -> Result<Option<SecretRecord>, StoreError>;

    /// Fetch a secret together with all grants held by `subject` on it,
    /// as one consistent snapshot.
    async fn secret_with_grants(
        &self,
        id: SecretId,
        subject: &Subject,
    ) -> Result<Option<(SecretRecord, Vec<GrantRecord>)>, StoreError>;

    /// Metadata for all secrets owned by `owner`.
    async fn list_secrets(&self, owner: &Subject) -> Result<Vec<SecretMeta>, StoreError>;

    /// Soft-delete a secret. Returns `false` if the id is unknown.
    /// Idempotent: re-revoking keeps the original revocation time.
    async fn revoke_secret(&self, id: SecretId, at: Timestamp) -> Result<bool, StoreError>;

    /// Hard-delete a secret. Only used to roll back a `store` whose
    /// audit append failed.
    async fn delete_secret(&self, id: SecretId) -> Result<(), StoreError>;

    /// Persist a grant.
    async fn insert_grant(&self, record: GrantRecord) -> Result<(), StoreError>;

    /// Delete all grants held by `subject` on `secret_id`. Grants are
    /// deletable independently of their secret's lifecycle.
    async fn delete_grants(&self, secret_id: SecretId, subject: &Subject)
        -> Result<(), StoreError>;

    /// Persist a new job.
    async fn insert_job(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Fetch a job by id.
    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Overwrite a job record with its updated state.
    async fn update_job(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Hard-delete a job. Only used to roll back a submission whose
    /// audit append failed.
    async fn delete_job(&self, id: JobId) -> Result<(), StoreError>;
}
