//! Shared fixtures: an in-process service wired over a fake sandbox
//! runner, an in-memory store, and a real file-backed audit log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use keyward::config::Config;
use keyward::sandbox::{verify_bundle_binding, Redactor, RunRequest, SandboxError, SandboxRunner};
use keyward::storage::memory::MemoryStore;
use keyward::storage::{GrantRecord, JobRecord, SecretMeta, SecretRecord, Store, StoreError};
use keyward::types::{
    CommandSpec, FailureReason, JobId, JobOutcome, JobState, OutputLine, OutputStream, SecretId,
    Subject, Timestamp,
};
use keyward::vault::keys::{StaticKeyManager, KEY_SIZE};
use keyward::vault::CredentialBundle;
use keyward::{Error, Keyward};
use keyward::audit::AuditLog;

/// How the fake runner ends each job it is handed.
#[derive(Clone, Copy)]
pub enum FakeBehavior {
    /// Emit a line and exit 0.
    Succeed,
    /// Emit each injected env pair through the redactor, then exit 0.
    EchoEnv,
    /// Emit a stderr line and exit with the given code.
    Exit(i64),
    /// Report a hard-kill at the wall-clock budget.
    Timeout,
    /// Never resolve unless killed; a kill ends the job as cancelled.
    HangUntilKilled,
    /// Never resolve at all, even when killed.
    Unresponsive,
}

/// In-process [`SandboxRunner`] double.
pub struct FakeRunner {
    behavior: FakeBehavior,
    runs: AtomicUsize,
    kill_signals: Mutex<HashMap<JobId, Arc<Notify>>>,
}

impl FakeRunner {
    pub fn new(behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            runs: AtomicUsize::new(0),
            kill_signals: Mutex::new(HashMap::new()),
        })
    }

    /// How many jobs reached a sandbox.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRunner for FakeRunner {
    async fn run(
        &self,
        request: RunRequest,
        bundle: CredentialBundle,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<JobOutcome, SandboxError> {
        verify_bundle_binding(&request, &bundle)?;
        self.runs.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            FakeBehavior::Succeed => {
                let _ = output
                    .send(OutputLine {
                        stream: OutputStream::Stdout,
                        line: format!("added 1 package: {}", request.spec.install_target()),
                    })
                    .await;
                Ok(JobOutcome::Succeeded)
            }
            FakeBehavior::EchoEnv => {
                let redactor = Redactor::new(bundle.exposed_values());
                for pair in bundle.env_pairs() {
                    let _ = output
                        .send(OutputLine {
                            stream: OutputStream::Stdout,
                            line: redactor.redact(&pair),
                        })
                        .await;
                }
                Ok(JobOutcome::Succeeded)
            }
            FakeBehavior::Exit(code) => {
                let _ = output
                    .send(OutputLine {
                        stream: OutputStream::Stderr,
                        line: "npm ERR! code E401".to_owned(),
                    })
                    .await;
                Ok(JobOutcome::Failed(FailureReason::Exit(code)))
            }
            FakeBehavior::Timeout => Ok(JobOutcome::Failed(FailureReason::Timeout)),
            FakeBehavior::HangUntilKilled => {
                let notify = Arc::new(Notify::new());
                self.kill_signals
                    .lock()
                    .await
                    .insert(request.job_id, Arc::clone(&notify));
                notify.notified().await;
                Ok(JobOutcome::Cancelled)
            }
            FakeBehavior::Unresponsive => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn kill(&self, job_id: JobId) {
        if let Some(notify) = self.kill_signals.lock().await.remove(&job_id) {
            notify.notify_one();
        }
    }
}

/// Store wrapper that holds the first Queued -> Running persist open
/// for a while, so a test can land a cancel inside that window.
pub struct StallingStore {
    inner: MemoryStore,
    armed: AtomicBool,
    stall: Duration,
}

impl StallingStore {
    pub fn new(stall: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(true),
            stall,
        })
    }
}

#[async_trait]
impl Store for StallingStore {
    async fn insert_secret(&self, record: SecretRecord) -> Result<(), StoreError> {
        self.inner.insert_secret(record).await
    }

    async fn secret(&self, id: SecretId) -> Result<Option<SecretRecord>, StoreError> {
        self.inner.secret(id).await
    }

    async fn secret_with_grants(
        &self,
        id: SecretId,
        subject: &Subject,
    ) -> Result<Option<(SecretRecord, Vec<GrantRecord>)>, StoreError> {
        self.inner.secret_with_grants(id, subject).await
    }

    async fn list_secrets(&self, owner: &Subject) -> Result<Vec<SecretMeta>, StoreError> {
        self.inner.list_secrets(owner).await
    }

    async fn revoke_secret(&self, id: SecretId, at: Timestamp) -> Result<bool, StoreError> {
        self.inner.revoke_secret(id, at).await
    }

    async fn delete_secret(&self, id: SecretId) -> Result<(), StoreError> {
        self.inner.delete_secret(id).await
    }

    async fn insert_grant(&self, record: GrantRecord) -> Result<(), StoreError> {
        self.inner.insert_grant(record).await
    }

    async fn delete_grants(
        &self,
        secret_id: SecretId,
        subject: &Subject,
    ) -> Result<(), StoreError> {
        self.inner.delete_grants(secret_id, subject).await
    }

    async fn insert_job(&self, record: JobRecord) -> Result<(), StoreError> {
        self.inner.insert_job(record).await
    }

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.inner.job(id).await
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        if record.state == JobState::Running && self.armed.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.update_job(record).await
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.delete_job(id).await
    }
}

/// Service over a fake runner, keeping a handle on the audit log path.
pub struct TestService {
    pub service: Keyward,
    pub runner: Arc<FakeRunner>,
    _dir: tempfile::TempDir,
}

pub fn build_service(behavior: FakeBehavior, tune: impl FnOnce(&mut Config)) -> TestService {
    build_service_with_store(Arc::new(MemoryStore::new()), behavior, tune)
}

pub fn build_service_with_store(
    store: Arc<dyn Store>,
    behavior: FakeBehavior,
    tune: impl FnOnce(&mut Config),
) -> TestService {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.audit.log_path = dir.path().join("audit.jsonl");
    tune(&mut config);

    let runner = FakeRunner::new(behavior);
    let audit = Arc::new(AuditLog::open(&config.audit.log_path).expect("audit log"));
    let service = Keyward::assemble(
        &config,
        store,
        Arc::new(StaticKeyManager::new(
            config.vault.key_ref.clone(),
            [7u8; KEY_SIZE],
        )),
        audit,
        runner.clone(),
    );
    TestService {
        service,
        runner,
        _dir: dir,
    }
}

pub fn spec(package: &str) -> CommandSpec {
    CommandSpec {
        package: package.to_owned(),
        version: Some("1.0.0".to_owned()),
        registry: None,
    }
}

/// Poll until the job reaches a terminal state.
pub async fn wait_terminal(
    service: &Keyward,
    requester: &Subject,
    job_id: JobId,
) -> keyward::storage::JobRecord {
    let deadline = Duration::from_secs(10);
    let poll = async {
        loop {
            let record = service.job(requester, job_id).await.expect("job lookup");
            if record.state.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(deadline, poll)
        .await
        .expect("job did not reach a terminal state")
}

/// Assert that a submission was rejected at admission.
pub async fn assert_limit_error(result: Result<JobId, Error>) {
    match result {
        Err(Error::LimitExceeded { .. }) => {}
        other => panic!("expected LimitExceeded, got {other:?}"),
    }
}
