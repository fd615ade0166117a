//! Sandboxed execution of install jobs.
//!
//! A runner takes one job, its credential bundle, and an output channel,
//! and returns the job's outcome. Implementations own isolation,
//! resource limits, secret injection, and cleanup. Output lines must be
//! redacted before they are sent down the channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{CommandSpec, JobId, JobOutcome, OutputLine};
use crate::vault::CredentialBundle;

pub mod docker;
pub mod redactor;

pub use docker::DockerRunner;
pub use redactor::{Redactor, REDACTION_MARKER};

/// Everything a runner needs to execute one job.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// The job being executed.
    pub job_id: JobId,
    /// The validated install command.
    pub spec: CommandSpec,
    /// Wall-clock budget; the runner hard-kills at expiry.
    pub timeout: Duration,
}

/// Errors produced by sandbox runners.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The bundle presented was issued for a different job.
    #[error("credential bundle for job {bundle} presented to job {job}")]
    BundleMismatch {
        /// Job the run was asked to execute.
        job: JobId,
        /// Job the bundle is bound to.
        bundle: JobId,
    },
    /// Container runtime or filesystem failure.
    #[error("sandbox infrastructure failure: {0}")]
    Infrastructure(String),
}

/// Refuse a bundle issued for a different job.
///
/// Every runner must call this before any sandbox resource is created:
/// a bundle is only ever valid inside the job it was materialized for.
///
/// # Errors
///
/// Returns [`SandboxError::BundleMismatch`] when the bundle's job id
/// differs from the run's.
pub fn verify_bundle_binding(
    request: &RunRequest,
    bundle: &CredentialBundle,
) -> Result<(), SandboxError> {
    if bundle.job_id() != request.job_id {
        return Err(SandboxError::BundleMismatch {
            job: request.job_id,
            bundle: bundle.job_id(),
        });
    }
    Ok(())
}

/// Executes install jobs in isolation.
///
/// The runner consumes the bundle: secrets are injected into the
/// sandbox environment at process start and dropped (zeroized) when the
/// run finishes, however it finishes.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Run one job to completion, streaming redacted output lines.
    ///
    /// Resolves with the job's outcome: success, failure with a reason
    /// (non-zero exit, timeout), or cancelled when [`kill`] interrupted
    /// the run. Infrastructure problems surface as errors.
    ///
    /// [`kill`]: SandboxRunner::kill
    async fn run(
        &self,
        request: RunRequest,
        bundle: CredentialBundle,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<JobOutcome, SandboxError>;

    /// Forcibly stop a running job. No-op if the job is not running.
    async fn kill(&self, job_id: JobId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{BundleEntry, SecretValue};

    fn request_for(job_id: JobId) -> RunRequest {
        RunRequest {
            job_id,
            spec: CommandSpec {
                package: "left-pad".to_owned(),
                version: Some("1.3.0".to_owned()),
                registry: None,
            },
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn bundle_bound_to_its_own_job_passes() {
        let job = JobId::generate();
        let bundle = CredentialBundle::new(job, Vec::new());
        assert!(verify_bundle_binding(&request_for(job), &bundle).is_ok());
    }

    #[test]
    fn bundle_for_another_job_is_rejected() {
        let issued_for = JobId::generate();
        let presented_to = JobId::generate();
        let bundle = CredentialBundle::new(
            issued_for,
            vec![BundleEntry {
                env_name: "NPM_TOKEN".to_owned(),
                value: SecretValue::new("abc123"),
            }],
        );

        let err = verify_bundle_binding(&request_for(presented_to), &bundle)
            .expect_err("cross-job bundle must be refused");
        match err {
            SandboxError::BundleMismatch { job, bundle } => {
                assert_eq!(job, presented_to);
                assert_eq!(bundle, issued_for);
            }
            other => panic!("expected BundleMismatch, got {other:?}"),
        }
    }
}
