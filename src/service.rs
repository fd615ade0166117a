//! The assembled service: vault, scheduler, and audit behind one facade.
//!
//! This is the boundary an embedding server (HTTP, RPC) calls into.
//! Every entry point takes an already-verified [`Subject`];
//! authentication lives outside this crate.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::broadcast;

use crate::audit::{AuditLog, AuditRecord};
use crate::config::Config;
use crate::error::Error;
use crate::sandbox::{DockerRunner, SandboxRunner};
use crate::scheduler::Scheduler;
use crate::storage::memory::MemoryStore;
use crate::storage::sqlite::SqliteStore;
use crate::storage::{JobRecord, SecretMeta, Store};
use crate::types::{Action, CommandSpec, JobId, OutputLine, SecretId, SecretRef, Subject};
use crate::vault::keys::{FileKeyManager, KeyManager, StaticKeyManager, KEY_SIZE};
use crate::vault::{SecretValue, Vault};

/// The credential vault and install-job service.
pub struct Keyward {
    vault: Arc<Vault>,
    scheduler: Arc<Scheduler>,
    audit: Arc<AuditLog>,
}

impl Keyward {
    /// Assemble the service from configuration: SQLite (or in-memory)
    /// store, file-backed master key, append-only audit log, and the
    /// Docker sandbox runner.
    ///
    /// # Errors
    ///
    /// Returns an error when the store, audit sink, or Docker daemon is
    /// unavailable. The service never starts without a working audit
    /// sink.
    pub async fn from_config(config: &Config) -> Result<Self, Error> {
        let store: Arc<dyn Store> = match &config.storage.db_path {
            Some(path) => Arc::new(
                SqliteStore::connect(path)
                    .await
                    .map_err(|e| Error::Infrastructure(e.to_string()))?,
            ),
            None => Arc::new(MemoryStore::new()),
        };

        let keys: Arc<dyn KeyManager> = match &config.vault.master_key_path {
            Some(path) => Arc::new(FileKeyManager::new(&config.vault.key_ref, path)),
            None => {
                // Ephemeral key for development runs without a key file.
                let mut key = [0u8; KEY_SIZE];
                OsRng.fill_bytes(&mut key);
                Arc::new(StaticKeyManager::new(config.vault.key_ref.clone(), key))
            }
        };

        let audit = Arc::new(AuditLog::open(&config.audit.log_path)?);
        let runner: Arc<dyn SandboxRunner> = Arc::new(
            DockerRunner::new(config.sandbox.clone())
                .await
                .map_err(|e| Error::Infrastructure(e.to_string()))?,
        );

        Ok(Self::assemble(config, store, keys, audit, runner))
    }

    /// Wire the service from explicit parts. The composition point for
    /// tests and embedders that bring their own store or runner.
    pub fn assemble(
        config: &Config,
        store: Arc<dyn Store>,
        keys: Arc<dyn KeyManager>,
        audit: Arc<AuditLog>,
        runner: Arc<dyn SandboxRunner>,
    ) -> Self {
        let vault = Arc::new(Vault::new(
            Arc::clone(&store),
            keys,
            Arc::clone(&audit),
            config.vault.key_ref.clone(),
        ));
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            config.sandbox.allowed_registries.clone(),
            store,
            Arc::clone(&vault),
            Arc::clone(&audit),
            runner,
        );
        Self {
            vault,
            scheduler,
            audit,
        }
    }

    /// Store a secret for `owner`. Returns the new id.
    pub async fn store_secret(
        &self,
        owner: &Subject,
        name: &str,
        service: Option<&str>,
        value: SecretValue,
    ) -> Result<SecretId, Error> {
        Ok(self.vault.store(owner, name, service, value).await?)
    }

    /// Grant `subject` actions on a secret owned by `owner`, optionally
    /// time-bounded.
    pub async fn grant(
        &self,
        owner: &Subject,
        secret_id: SecretId,
        subject: &Subject,
        actions: &[Action],
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        Ok(self
            .vault
            .grant(owner, secret_id, subject, actions, ttl)
            .await?)
    }

    /// Delete all grants `subject` holds on one of `owner`'s secrets.
    pub async fn revoke_grant(
        &self,
        owner: &Subject,
        secret_id: SecretId,
        subject: &Subject,
    ) -> Result<(), Error> {
        Ok(self.vault.revoke_grant(owner, secret_id, subject).await?)
    }

    /// Revoke a secret. Takes effect for every future materialization.
    pub async fn revoke_secret(&self, owner: &Subject, secret_id: SecretId) -> Result<(), Error> {
        Ok(self.vault.revoke(owner, secret_id).await?)
    }

    /// Metadata for all secrets owned by `owner`.
    pub async fn list_secrets(&self, owner: &Subject) -> Result<Vec<SecretMeta>, Error> {
        Ok(self.vault.list(owner).await?)
    }

    /// Submit an npm install job with declared secret references.
    pub async fn submit_install(
        &self,
        requester: &Subject,
        spec: CommandSpec,
        secret_refs: Vec<SecretRef>,
    ) -> Result<JobId, Error> {
        self.scheduler.submit(requester, spec, secret_refs).await
    }

    /// Fetch a job's current record, including redacted output once it
    /// has run.
    pub async fn job(&self, requester: &Subject, job_id: JobId) -> Result<JobRecord, Error> {
        self.scheduler.job(requester, job_id).await
    }

    /// Subscribe to the live redacted output of a queued or running job.
    pub async fn follow(
        &self,
        requester: &Subject,
        job_id: JobId,
    ) -> Result<broadcast::Receiver<OutputLine>, Error> {
        self.scheduler.follow(requester, job_id).await
    }

    /// Cancel a job.
    pub async fn cancel(&self, requester: &Subject, job_id: JobId) -> Result<(), Error> {
        self.scheduler.cancel(requester, job_id).await
    }

    /// Export audit records, oldest first, optionally bounded below by
    /// a timestamp.
    pub fn export_audit(&self, since: Option<DateTime<Utc>>) -> Result<Vec<AuditRecord>, Error> {
        Ok(self.audit.export(since)?)
    }
}
