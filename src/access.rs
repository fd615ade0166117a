//! Access control evaluation.
//!
//! Decides, for a (subject, secret, action) triple, whether the action
//! is permitted. The decision is a pure function of one consistent
//! secret/grant snapshot; nothing is cached across requests, so a
//! revocation is visible to the very next evaluation.

use chrono::Utc;

use crate::storage::{GrantRecord, SecretRecord};
use crate::types::{Action, Subject, Timestamp};

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The action is permitted.
    Allow,
    /// The action is denied, with a caller-safe reason.
    Deny(String),
}

impl Decision {
    /// Whether the action was permitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Evaluate a (subject, secret, action) triple against a snapshot of
/// the secret and the subject's grants on it, at time `now`.
///
/// Owners implicitly hold all actions on their own secrets. Everyone
/// else needs an unexpired grant listing the action, and no grant is
/// honored on a revoked secret.
pub fn evaluate(
    subject: &Subject,
    action: Action,
    secret: &SecretRecord,
    grants: &[GrantRecord],
    now: Timestamp,
) -> Decision {
    if secret.is_revoked() {
        return Decision::Deny(format!("secret {} is revoked", secret.id));
    }
    if &secret.owner == subject {
        return Decision::Allow;
    }
    let permitted = grants
        .iter()
        .filter(|grant| grant.secret_id == secret.id && &grant.subject == subject)
        .any(|grant| grant.allows(action, now));
    if permitted {
        Decision::Allow
    } else {
        Decision::Deny(format!(
            "no active grant for {subject} on secret {} covering {action:?}",
            secret.id
        ))
    }
}

/// [`evaluate`] at the current time.
pub fn evaluate_now(
    subject: &Subject,
    action: Action,
    secret: &SecretRecord,
    grants: &[GrantRecord],
) -> Decision {
    evaluate(subject, action, secret, grants, Utc::now())
}
