//! Configuration loading and validation.
//!
//! One human-owned `config.toml` with sections for the vault, primary
//! store, sandbox limits, scheduler limits, and the audit sink.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    /// Vault key management settings.
    #[serde(default)]
    pub vault: VaultConfig,

    /// Primary transactional store.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Sandbox image and resource limits.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Scheduler concurrency and queue limits.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Audit log sink.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Vault key management settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// Key reference recorded on every stored secret.
    #[serde(default = "default_key_ref")]
    pub key_ref: String,

    /// Path to the base64-encoded 32-byte master key file.
    pub master_key_path: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_ref: default_key_ref(),
            master_key_path: None,
        }
    }
}

/// Primary transactional store settings.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. `None` selects the in-memory store.
    pub db_path: Option<PathBuf>,
}

/// Sandbox image and resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Container image used for install jobs.
    #[serde(default = "default_image")]
    pub image: String,

    /// Memory limit in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    /// CPU core limit.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,

    /// Maximum number of processes inside the sandbox.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Root directory for per-job workspaces.
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: PathBuf,

    /// Docker network for jobs whose registry is allow-listed. The
    /// network is expected to be egress-filtered; jobs without an
    /// allow-listed registry run with no network at all.
    pub network: Option<String>,

    /// Registry URLs jobs may install from.
    #[serde(default = "default_registries")]
    pub allowed_registries: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            memory_mb: default_memory_mb(),
            cpu_cores: default_cpu_cores(),
            pids_limit: default_pids_limit(),
            workspaces_dir: default_workspaces_dir(),
            network: None,
            allowed_registries: default_registries(),
        }
    }
}

/// Scheduler concurrency and queue limits.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Global maximum of concurrently running jobs.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-requester cap on simultaneously running jobs.
    #[serde(default = "default_per_requester_running")]
    pub per_requester_running: usize,

    /// Per-requester queue depth; submissions beyond it are rejected.
    #[serde(default = "default_queue_depth")]
    pub per_requester_queue_depth: usize,

    /// Wall-clock timeout per job in seconds (hard kill).
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Extra seconds past the timeout before a silent runner is
    /// declared lost and the job failed.
    #[serde(default = "default_liveness_grace_secs")]
    pub liveness_grace_secs: u64,

    /// Bounded retry attempts for infrastructure errors at dispatch.
    #[serde(default = "default_dispatch_retries")]
    pub dispatch_retries: u32,

    /// Base backoff in milliseconds between dispatch retries (doubles
    /// per attempt).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            per_requester_running: default_per_requester_running(),
            per_requester_queue_depth: default_queue_depth(),
            job_timeout_secs: default_job_timeout_secs(),
            liveness_grace_secs: default_liveness_grace_secs(),
            dispatch_retries: default_dispatch_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Audit log sink settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Append-only audit log path, kept apart from the primary store.
    #[serde(default = "default_audit_path")]
    pub log_path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: default_audit_path(),
        }
    }
}

// Default value functions for serde

fn default_key_ref() -> String {
    "local-master-v1".to_owned()
}
fn default_image() -> String {
    "node:20-alpine".to_owned()
}
fn default_memory_mb() -> u32 {
    2048
}
fn default_cpu_cores() -> f64 {
    2.0
}
fn default_pids_limit() -> i64 {
    256
}
fn default_workspaces_dir() -> PathBuf {
    PathBuf::from("/var/lib/keyward/workspaces")
}
fn default_registries() -> Vec<String> {
    vec!["https://registry.npmjs.org".to_owned()]
}
fn default_max_concurrent() -> usize {
    4
}
fn default_per_requester_running() -> usize {
    2
}
fn default_queue_depth() -> usize {
    16
}
fn default_job_timeout_secs() -> u64 {
    600
}
fn default_liveness_grace_secs() -> u64 {
    30
}
fn default_dispatch_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_audit_path() -> PathBuf {
    PathBuf::from("/var/log/keyward/audit.jsonl")
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Resolve the default data directory (`~/.keyward/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".keyward"))
}
