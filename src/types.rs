//! Core identifiers and domain types shared across components.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A verified subject identity (user or service account).
///
/// Authentication happens in the excluded outer layer; by the time a
/// `Subject` reaches this crate it is already verified. The core only
/// authorizes actions for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    /// Wrap a verified identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a stored secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretId(Uuid);

impl SecretId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of an install job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Closed set of actions a grant can permit on a secret.
///
/// Kept as an enum rather than free-form strings so authorization
/// decisions stay statically checkable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Read secret metadata.
    Read,
    /// Materialize the secret into a job's credential bundle.
    UseInJob,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting for a sandbox slot.
    Queued,
    /// Executing inside a sandbox.
    Running,
    /// Command exited 0.
    Succeeded,
    /// Command failed, timed out, or the runner was lost.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl JobState {
    /// Whether this state is terminal. Terminal states are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Command exited with a non-zero code.
    Exit(i64),
    /// Hard-killed after exceeding its wall-clock timeout.
    Timeout,
    /// The runner stopped responding past the liveness grace window.
    RunnerLost,
    /// A requested secret reference was denied; no sandbox was created.
    Authorization(String),
    /// Vault or sandbox infrastructure was unavailable after retries.
    Infrastructure(String),
}

/// Terminal result of a sandbox run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Command exited 0.
    Succeeded,
    /// Command failed; see reason.
    Failed(FailureReason),
    /// Killed by an explicit cancellation request.
    Cancelled,
}

impl JobOutcome {
    /// The job state corresponding to this outcome.
    pub fn state(&self) -> JobState {
        match self {
            Self::Succeeded => JobState::Succeeded,
            Self::Failed(_) => JobState::Failed,
            Self::Cancelled => JobState::Cancelled,
        }
    }
}

/// A declared secret reference on a job: which secret, and the
/// environment variable name it materializes into inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    /// The referenced secret.
    pub secret_id: SecretId,
    /// Environment variable name inside the sandbox (e.g. `NPM_TOKEN`).
    pub env_name: String,
}

/// One npm install invocation: package, optional version pin, optional
/// registry override. Secrets are never part of the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// npm package name (scoped names allowed).
    pub package: String,
    /// Optional version or range (e.g. `1.2.3`, `^2.0.0`).
    pub version: Option<String>,
    /// Optional registry URL; must be on the configured allow-list.
    pub registry: Option<String>,
}

fn package_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
        Regex::new(r"^(@[a-z0-9\-~][a-z0-9\-._~]*/)?[a-z0-9\-~][a-z0-9\-._~]*$").unwrap()
    })
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
        Regex::new(r"^[0-9A-Za-z.^~<>=+\-]+$").unwrap()
    })
}

fn env_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
        Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap()
    })
}

impl CommandSpec {
    /// Validate the spec against npm naming rules and the registry
    /// allow-list. Malformed specs are rejected before a job exists.
    pub fn validate(&self, allowed_registries: &[String]) -> Result<(), String> {
        if self.package.is_empty() || self.package.len() > 214 {
            return Err(format!(
                "package name length must be 1-214, got {}",
                self.package.len()
            ));
        }
        if !package_re().is_match(&self.package) {
            return Err(format!("invalid package name '{}'", self.package));
        }
        if let Some(version) = &self.version {
            if version.is_empty() || version.len() > 64 || !version_re().is_match(version) {
                return Err(format!("invalid version spec '{version}'"));
            }
        }
        if let Some(registry) = &self.registry {
            if !allowed_registries.iter().any(|r| r == registry) {
                return Err(format!("registry '{registry}' is not on the allow-list"));
            }
        }
        Ok(())
    }

    /// The `package` or `package@version` install target.
    pub fn install_target(&self) -> String {
        match &self.version {
            Some(version) => format!("{}@{version}", self.package),
            None => self.package.clone(),
        }
    }

    /// Render the full argv for the sandboxed install command.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            "npm".to_owned(),
            "install".to_owned(),
            self.install_target(),
        ];
        if let Some(registry) = &self.registry {
            argv.push("--registry".to_owned());
            argv.push(registry.clone());
        }
        argv
    }
}

/// Validate a declared environment variable name for a secret ref.
pub fn validate_env_name(name: &str) -> Result<(), String> {
    if name.len() > 128 || !env_name_re().is_match(name) {
        return Err(format!("invalid environment variable name '{name}'"));
    }
    Ok(())
}

/// Which sandbox stream a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One redacted line of sandbox output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Source stream.
    pub stream: OutputStream,
    /// Line content, already passed through the redactor.
    pub line: String,
}

/// Convenience alias for UTC timestamps.
pub type Timestamp = DateTime<Utc>;
