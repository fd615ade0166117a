//! Job-scoped credential bundles.
//!
//! A bundle is the only form in which plaintext ever leaves the vault.
//! It is bound to exactly one job id, never cloned, never logged, and
//! zeroized when dropped at the end of that job.

use zeroize::Zeroize;

use crate::types::JobId;

/// Opaque secret value. Debug output always shows `__REDACTED__` so a
/// stray format call can never leak plaintext into logs or errors.
/// Zeroized on drop.
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap a plaintext value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the plaintext. Use only at the sandbox injection point.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// One materialized entry: environment variable name and its value.
#[derive(Debug)]
pub struct BundleEntry {
    /// Environment variable name inside the sandbox.
    pub env_name: String,
    /// The decrypted value.
    pub value: SecretValue,
}

/// An ephemeral, job-scoped set of decrypted secrets.
///
/// Held exclusively by the sandbox runner executing the tagged job.
/// Not `Clone`: there is exactly one copy, and it dies with the run.
pub struct CredentialBundle {
    job_id: JobId,
    entries: Vec<BundleEntry>,
}

impl CredentialBundle {
    /// Build a bundle tagged with the job it was issued for.
    pub fn new(job_id: JobId, entries: Vec<BundleEntry>) -> Self {
        Self { job_id, entries }
    }

    /// The job this bundle is bound to.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The materialized entries.
    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    /// `NAME=value` pairs for process-start environment injection.
    /// Secrets go into the environment, never onto the command line.
    pub fn env_pairs(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| format!("{}={}", entry.env_name, entry.value.expose()))
            .collect()
    }

    /// The plaintext values, for seeding the output redactor.
    pub fn exposed_values(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.value.expose().to_owned())
            .collect()
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("job_id", &self.job_id)
            .field("entries", &self.entries.len())
            .finish()
    }
}
