//! Append-only audit log.
//!
//! Writes structured JSON entries, one per line, to a sink kept apart
//! from the primary store. Every vault and scheduler operation appends
//! one record synchronously before returning; a failed append aborts
//! the triggering operation (fail-closed). Secret plaintext never
//! reaches this module.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Subject, Timestamp};

/// Audit failures. An append failure must abort the operation that
/// triggered it.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The sink could not be opened or written.
    #[error("audit sink error: {0}")]
    Sink(String),
    /// Export was requested on a writer-only log (no readable path).
    #[error("audit log has no readable path")]
    NoReadPath,
    /// A stored line could not be parsed back.
    #[error("corrupt audit record: {0}")]
    Corrupt(String),
}

/// What happened, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A secret was stored.
    SecretStored,
    /// A grant was issued on a secret.
    GrantIssued,
    /// A subject's grants on a secret were deleted.
    GrantRevoked,
    /// A secret was revoked.
    SecretRevoked,
    /// A credential bundle was materialized for a job.
    BundleMaterialized,
    /// A materialize request was denied.
    MaterializeDenied,
    /// An install job was accepted.
    JobSubmitted,
    /// A job entered a sandbox.
    JobStarted,
    /// A job finished with exit 0.
    JobSucceeded,
    /// A job failed (non-zero exit, timeout, lost runner, denied refs).
    JobFailed,
    /// A job was cancelled.
    JobCancelled,
}

/// How the audited operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Operation completed.
    Ok,
    /// Operation was denied by authorization.
    Denied,
    /// Operation failed for another reason.
    Error,
}

/// A single append-only audit record. Never mutated or deleted once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the operation happened.
    pub timestamp: Timestamp,
    /// Verified subject that performed the operation.
    pub actor: Subject,
    /// What was done.
    pub action: AuditAction,
    /// Target entity (secret id, job id).
    pub target: String,
    /// How it ended.
    pub outcome: AuditOutcome,
    /// Structured context. Never contains secret plaintext.
    pub details: serde_json::Value,
}

impl AuditRecord {
    /// Build a record stamped with the current time.
    pub fn now(
        actor: Subject,
        action: AuditAction,
        target: impl Into<String>,
        outcome: AuditOutcome,
        details: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor,
            action,
            target: target.into(),
            outcome,
            details,
        }
    }
}

/// Append-only JSON-lines audit log.
pub struct AuditLog {
    writer: Mutex<Box<dyn Write + Send>>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Open (or create) an append-only log at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| AuditError::Sink(e.to_string()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| AuditError::Sink(e.to_string()))?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
            path: Some(path.as_ref().to_path_buf()),
        })
    }

    /// Create an audit log over an arbitrary writer (for testing).
    /// Export is unavailable in this mode.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            path: None,
        }
    }

    /// Append one record and flush before returning.
    ///
    /// # Errors
    ///
    /// Any failure here must abort the operation being audited.
    pub fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record).map_err(|e| AuditError::Sink(e.to_string()))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| AuditError::Sink(format!("audit lock poisoned: {e}")))?;
        writeln!(writer, "{line}").map_err(|e| AuditError::Sink(e.to_string()))?;
        writer.flush().map_err(|e| AuditError::Sink(e.to_string()))?;
        Ok(())
    }

    /// Read back records, oldest first, optionally bounded below by a
    /// timestamp. For external compliance tooling.
    ///
    /// # Errors
    ///
    /// Returns an error for writer-only logs or unreadable/corrupt files.
    pub fn export(&self, since: Option<DateTime<Utc>>) -> Result<Vec<AuditRecord>, AuditError> {
        let path = self.path.as_ref().ok_or(AuditError::NoReadPath)?;
        let contents =
            std::fs::read_to_string(path).map_err(|e| AuditError::Sink(e.to_string()))?;
        let mut records = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord =
                serde_json::from_str(line).map_err(|e| AuditError::Corrupt(e.to_string()))?;
            if since.map_or(true, |cutoff| record.timestamp >= cutoff) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
