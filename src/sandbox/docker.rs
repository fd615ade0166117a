//! Docker-backed sandbox runner.
//!
//! One hardened container per job: capabilities dropped, read-only root
//! filesystem, pids/memory/cpu limits, and no network unless an
//! egress-filtered network is configured. Secrets enter only through
//! the container environment at creation; the container and its
//! workspace are removed unconditionally when the run ends.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::types::{FailureReason, JobId, JobOutcome, OutputLine, OutputStream};
use crate::vault::CredentialBundle;

use super::redactor::Redactor;
use super::{RunRequest, SandboxError, SandboxRunner};

struct ActiveJob {
    container_name: String,
    killed: Arc<AtomicBool>,
}

/// Per-job container sandbox over the local Docker daemon.
pub struct DockerRunner {
    docker: Docker,
    config: SandboxConfig,
    active: Mutex<HashMap<JobId, ActiveJob>>,
}

impl DockerRunner {
    /// Connect to the local Docker daemon and prepare the workspace
    /// root.
    ///
    /// # Errors
    ///
    /// Returns an error when Docker cannot be reached or the workspace
    /// directory cannot be created.
    pub async fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
        tokio::fs::create_dir_all(&config.workspaces_dir)
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
        Ok(Self {
            docker,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Returns true if the Docker daemon is reachable.
    pub async fn docker_available() -> bool {
        match Docker::connect_with_local_defaults() {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    fn container_name(job_id: JobId) -> String {
        format!("keyward-job-{job_id}")
    }

    fn workspace_dir(&self, job_id: JobId) -> PathBuf {
        self.config.workspaces_dir.join(job_id.to_string())
    }

    fn build_container_config(
        &self,
        request: &RunRequest,
        bundle: &CredentialBundle,
        workspace: &std::path::Path,
    ) -> Result<ContainerConfig<String>, SandboxError> {
        let memory_limit = i64::from(self.config.memory_mb)
            .saturating_mul(1024)
            .saturating_mul(1024);
        let cpu_limit = f64_to_nano_cpu(self.config.cpu_cores)?;

        // Outbound access only through the operator-configured
        // egress-filtered network; otherwise no network at all.
        let network_mode = self
            .config
            .network
            .clone()
            .unwrap_or_else(|| "none".to_owned());

        let mut tmpfs: HashMap<String, String> = HashMap::new();
        tmpfs.insert("/tmp".to_owned(), "rw,size=512m".to_owned());

        let host_config = HostConfig {
            network_mode: Some(network_mode),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_owned()]),
            pids_limit: Some(self.config.pids_limit),
            memory: Some(memory_limit),
            nano_cpus: Some(cpu_limit),
            binds: Some(vec![format!("{}:/workspace", workspace.display())]),
            tmpfs: Some(tmpfs),
            auto_remove: Some(false),
            ..Default::default()
        };

        // Secrets go in through the environment, never the command line.
        let mut env = bundle.env_pairs();
        env.push("HOME=/tmp".to_owned());
        env.push("npm_config_cache=/tmp/.npm".to_owned());

        Ok(ContainerConfig {
            image: Some(self.config.image.clone()),
            cmd: Some(request.spec.argv()),
            user: Some("node".to_owned()),
            working_dir: Some("/workspace".to_owned()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    async fn remove_container(&self, name: &str) {
        let opts = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(opts)).await {
            debug!(container = name, error = %e, "container removal failed");
        }
    }

    async fn cleanup(&self, job_id: JobId, container_name: &str) {
        self.remove_container(container_name).await;
        let workspace = self.workspace_dir(job_id);
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job = %job_id, error = %e, "workspace cleanup failed");
            }
        }
        self.active.lock().await.remove(&job_id);
    }

    fn spawn_log_forwarder(
        &self,
        container_name: String,
        redactor: Redactor,
        output: mpsc::Sender<OutputLine>,
    ) -> tokio::task::JoinHandle<()> {
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&container_name, Some(options));
            let mut stdout_buf = String::new();
            let mut stderr_buf = String::new();
            while let Some(chunk) = stream.next().await {
                let log = match chunk {
                    Ok(log) => log,
                    Err(_) => break,
                };
                let (stream_kind, buf, message) = match log {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        (OutputStream::Stdout, &mut stdout_buf, message)
                    }
                    LogOutput::StdErr { message } => {
                        (OutputStream::Stderr, &mut stderr_buf, message)
                    }
                    _ => continue,
                };
                buf.push_str(&String::from_utf8_lossy(&message));
                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let sent = output
                        .send(OutputLine {
                            stream: stream_kind,
                            line: redactor.redact(line.trim_end_matches('\n')),
                        })
                        .await;
                    if sent.is_err() {
                        return;
                    }
                }
            }
            for (stream_kind, buf) in [
                (OutputStream::Stdout, stdout_buf),
                (OutputStream::Stderr, stderr_buf),
            ] {
                if !buf.is_empty() {
                    let _ = output
                        .send(OutputLine {
                            stream: stream_kind,
                            line: redactor.redact(&buf),
                        })
                        .await;
                }
            }
        })
    }

    async fn execute(
        &self,
        request: &RunRequest,
        bundle: &CredentialBundle,
        container_name: &str,
        killed: &Arc<AtomicBool>,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<JobOutcome, SandboxError> {
        let workspace = self.workspace_dir(request.job_id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

        let container_config = self.build_container_config(request, bundle, &workspace)?;
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.to_owned(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
        self.docker
            .start_container(container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

        let forwarder = self.spawn_log_forwarder(
            container_name.to_owned(),
            Redactor::new(bundle.exposed_values()),
            output,
        );

        let mut wait = self
            .docker
            .wait_container(container_name, None::<WaitContainerOptions<String>>);
        let waited = tokio::time::timeout(request.timeout, wait.next()).await;

        let outcome = match waited {
            // Hard kill at the deadline; no grace period for the job.
            Err(_) => {
                self.remove_container(container_name).await;
                JobOutcome::Failed(FailureReason::Timeout)
            }
            Ok(response) => {
                if killed.load(Ordering::SeqCst) {
                    JobOutcome::Cancelled
                } else {
                    match response {
                        Some(Ok(body)) if body.status_code == 0 => JobOutcome::Succeeded,
                        Some(Ok(body)) => JobOutcome::Failed(FailureReason::Exit(body.status_code)),
                        Some(Err(e)) => {
                            return Err(SandboxError::Infrastructure(e.to_string()));
                        }
                        None => {
                            return Err(SandboxError::Infrastructure(
                                "container wait stream ended without a status".to_owned(),
                            ));
                        }
                    }
                }
            }
        };

        // Let the forwarder drain whatever the daemon buffered.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), forwarder).await;
        Ok(outcome)
    }
}

#[async_trait::async_trait]
impl SandboxRunner for DockerRunner {
    async fn run(
        &self,
        request: RunRequest,
        bundle: CredentialBundle,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<JobOutcome, SandboxError> {
        super::verify_bundle_binding(&request, &bundle)?;

        let container_name = Self::container_name(request.job_id);
        let killed = Arc::new(AtomicBool::new(false));
        self.active.lock().await.insert(
            request.job_id,
            ActiveJob {
                container_name: container_name.clone(),
                killed: Arc::clone(&killed),
            },
        );

        let result = self
            .execute(&request, &bundle, &container_name, &killed, output)
            .await;
        self.cleanup(request.job_id, &container_name).await;
        // Bundle drops here; plaintext is zeroized with it.
        drop(bundle);
        result
    }

    async fn kill(&self, job_id: JobId) {
        let entry = {
            let active = self.active.lock().await;
            active
                .get(&job_id)
                .map(|job| (job.container_name.clone(), Arc::clone(&job.killed)))
        };
        if let Some((container_name, killed)) = entry {
            killed.store(true, Ordering::SeqCst);
            self.remove_container(&container_name).await;
        }
    }
}

fn f64_to_nano_cpu(cpu_cores: f64) -> Result<i64, SandboxError> {
    if !cpu_cores.is_finite() || cpu_cores <= 0.0 {
        return Err(SandboxError::Infrastructure(
            "cpu_cores must be a positive finite number".to_owned(),
        ));
    }

    let rendered = format!("{cpu_cores:.9}");
    let mut parts = rendered.split('.');
    let whole_part_raw = parts.next().unwrap_or("0");
    let fraction_part_raw = parts.next().unwrap_or("0");

    let whole_part = whole_part_raw
        .parse::<i64>()
        .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;
    let mut fraction = fraction_part_raw.to_owned();
    while fraction.len() < 9 {
        fraction.push('0');
    }
    if fraction.len() > 9 {
        fraction.truncate(9);
    }
    let fractional_part = fraction
        .parse::<i64>()
        .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

    let nanos = whole_part
        .checked_mul(1_000_000_000)
        .and_then(|value| value.checked_add(fractional_part))
        .ok_or_else(|| SandboxError::Infrastructure("cpu_cores exceed supported range".to_owned()))?;

    if nanos <= 0 {
        return Err(SandboxError::Infrastructure(
            "cpu_cores converted to non-positive nano CPU value".to_owned(),
        ));
    }
    Ok(nanos)
}
