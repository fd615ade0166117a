//! Job scheduling: admission, fairness, dispatch, and lifecycle.
//!
//! One FIFO queue per requester, drained round-robin so no requester
//! can starve the others, with a global concurrency cap and a bounded
//! per-requester queue depth (admission is rejected, never silently
//! dropped, when the bound is hit). The scheduler is the only writer of
//! job state transitions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use crate::audit::{AuditAction, AuditLog, AuditOutcome, AuditRecord};
use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::sandbox::{RunRequest, SandboxRunner};
use crate::storage::{JobRecord, Store};
use crate::types::{
    validate_env_name, CommandSpec, FailureReason, JobId, JobOutcome, JobState, OutputLine,
    SecretRef, Subject,
};
use crate::vault::{Vault, VaultError};

const FOLLOW_CHANNEL_CAPACITY: usize = 256;

/// Pending queues and running counts. One lock covers all of it, so an
/// admission check and the enqueue it guards are atomic.
#[derive(Default)]
struct SchedState {
    queues: HashMap<Subject, VecDeque<JobId>>,
    round_robin: VecDeque<Subject>,
    running: HashMap<Subject, usize>,
    cancelled: HashSet<JobId>,
}

impl SchedState {
    fn enqueue(&mut self, requester: &Subject, job_id: JobId) {
        if !self.round_robin.contains(requester) {
            self.round_robin.push_back(requester.clone());
        }
        self.queues
            .entry(requester.clone())
            .or_default()
            .push_back(job_id);
    }

    fn queue_depth(&self, requester: &Subject) -> usize {
        self.queues.get(requester).map_or(0, VecDeque::len)
    }

    fn running_count(&self, requester: &Subject) -> usize {
        self.running.get(requester).copied().unwrap_or(0)
    }

    /// Pop the next dispatchable job, walking requesters in round-robin
    /// order and skipping any at their running cap. The chosen
    /// requester rotates to the back.
    fn next_eligible(&mut self, per_requester_running: usize) -> Option<(Subject, JobId)> {
        for _ in 0..self.round_robin.len() {
            let Some(requester) = self.round_robin.pop_front() else {
                break;
            };
            let has_queued = self.queue_depth(&requester) > 0;
            let at_cap = self.running_count(&requester) >= per_requester_running;
            if has_queued && !at_cap {
                let job_id = self
                    .queues
                    .get_mut(&requester)
                    .and_then(VecDeque::pop_front);
                if self.queue_depth(&requester) == 0 {
                    self.queues.remove(&requester);
                } else {
                    self.round_robin.push_back(requester.clone());
                }
                if let Some(job_id) = job_id {
                    let count = self.running.entry(requester.clone()).or_insert(0);
                    *count = count.saturating_add(1);
                    return Some((requester, job_id));
                }
            } else if has_queued {
                // Keep the requester in rotation for the next slot.
                self.round_robin.push_back(requester);
            }
            // Requesters with empty queues drop out of the rotation.
        }
        None
    }

    fn release(&mut self, requester: &Subject) {
        if let Some(count) = self.running.get_mut(requester) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.running.remove(requester);
            }
        }
    }

    /// Remove a queued job. Returns true if it was still queued.
    fn remove_queued(&mut self, requester: &Subject, job_id: JobId) -> bool {
        let Some(queue) = self.queues.get_mut(requester) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|queued| *queued != job_id);
        let removed = before != queue.len();
        if queue.is_empty() {
            self.queues.remove(requester);
        }
        removed
    }
}

/// The job scheduler. Owns admission, dispatch, and every job state
/// transition.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    vault: Arc<Vault>,
    audit: Arc<AuditLog>,
    runner: Arc<dyn SandboxRunner>,
    state: Mutex<SchedState>,
    slots: Arc<Semaphore>,
    followers: Mutex<HashMap<JobId, broadcast::Sender<OutputLine>>>,
    allowed_registries: Vec<String>,
}

impl Scheduler {
    /// Build a scheduler over the store, vault, audit sink, and runner.
    pub fn new(
        config: SchedulerConfig,
        allowed_registries: Vec<String>,
        store: Arc<dyn Store>,
        vault: Arc<Vault>,
        audit: Arc<AuditLog>,
        runner: Arc<dyn SandboxRunner>,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Arc::new(Self {
            config,
            store,
            vault,
            audit,
            runner,
            state: Mutex::new(SchedState::default()),
            slots,
            followers: Mutex::new(HashMap::new()),
            allowed_registries,
        })
    }

    /// Submit an install job. Validates the command and refs, persists
    /// and audits the submission, and queues it for dispatch.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed request, or a limit
    /// error when the requester's queue is full. Rejected requests
    /// leave no job behind.
    pub async fn submit(
        self: &Arc<Self>,
        requester: &Subject,
        spec: CommandSpec,
        secret_refs: Vec<SecretRef>,
    ) -> Result<JobId, Error> {
        spec.validate(&self.allowed_registries)
            .map_err(Error::Validation)?;
        let mut seen = HashSet::new();
        for secret_ref in &secret_refs {
            validate_env_name(&secret_ref.env_name).map_err(Error::Validation)?;
            if !seen.insert(secret_ref.env_name.clone()) {
                return Err(Error::Validation(format!(
                    "duplicate environment variable name '{}'",
                    secret_ref.env_name
                )));
            }
        }

        let record = JobRecord::queued(requester.clone(), spec, secret_refs);
        let job_id = record.id;

        // Register the follow channel before the job can dispatch, so
        // the dispatch path always finds (and later removes) it.
        let (sender, _) = broadcast::channel(FOLLOW_CHANNEL_CAPACITY);
        self.followers.lock().await.insert(job_id, sender);

        {
            let mut state = self.state.lock().await;
            if state.queue_depth(requester) >= self.config.per_requester_queue_depth {
                drop(state);
                self.followers.lock().await.remove(&job_id);
                return Err(Error::LimitExceeded {
                    what: format!("queue depth for {requester}"),
                    limit: self.config.per_requester_queue_depth,
                });
            }
            if let Err(e) = self.store.insert_job(record.clone()).await {
                drop(state);
                self.followers.lock().await.remove(&job_id);
                return Err(e.into());
            }
            if let Err(audit_err) = self.audit.append(&AuditRecord::now(
                requester.clone(),
                AuditAction::JobSubmitted,
                job_id.to_string(),
                AuditOutcome::Ok,
                serde_json::json!({
                    "package": record.spec.install_target(),
                    "secret_refs": record.secret_refs.len(),
                }),
            )) {
                // Unaudited jobs must not exist; roll the insert back.
                if let Err(rollback_err) = self.store.delete_job(job_id).await {
                    warn!(job = %job_id, error = %rollback_err, "failed to roll back unaudited job");
                }
                drop(state);
                self.followers.lock().await.remove(&job_id);
                return Err(audit_err.into());
            }
            state.enqueue(requester, job_id);
        }

        info!(job = %job_id, requester = %requester, "job submitted");
        self.clone().pump().await;
        Ok(job_id)
    }

    /// Fetch a job visible to `requester`. Jobs are visible only to the
    /// subject that submitted them.
    pub async fn job(&self, requester: &Subject, job_id: JobId) -> Result<JobRecord, Error> {
        let record = self
            .store
            .job(job_id)
            .await?
            .filter(|record| &record.requester == requester)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        Ok(record)
    }

    /// Subscribe to the live redacted output stream of a queued or
    /// running job. A slow subscriber that falls behind the channel
    /// capacity loses the oldest lines, never blocks the job.
    pub async fn follow(
        &self,
        requester: &Subject,
        job_id: JobId,
    ) -> Result<broadcast::Receiver<OutputLine>, Error> {
        let record = self.job(requester, job_id).await?;
        if record.state.is_terminal() {
            return Err(Error::Validation(format!(
                "job {job_id} is terminal; read its stored output instead"
            )));
        }
        let followers = self.followers.lock().await;
        followers
            .get(&job_id)
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    /// Cancel a job. Queued jobs go straight to `Cancelled`; running
    /// jobs are hard-killed and reach `Cancelled` through the dispatch
    /// path. Cancelling an already-terminal job is a no-op.
    pub async fn cancel(&self, requester: &Subject, job_id: JobId) -> Result<(), Error> {
        let mut record = self.job(requester, job_id).await?;
        match record.state {
            JobState::Queued => {
                let removed = {
                    let mut state = self.state.lock().await;
                    let removed = state.remove_queued(requester, job_id);
                    if !removed {
                        // Popped for dispatch but not yet running; the
                        // dispatch task honors this flag.
                        state.cancelled.insert(job_id);
                    }
                    removed
                };
                if removed {
                    record.complete(JobOutcome::Cancelled)?;
                    self.store.update_job(&record).await?;
                    self.audit.append(&AuditRecord::now(
                        requester.clone(),
                        AuditAction::JobCancelled,
                        job_id.to_string(),
                        AuditOutcome::Ok,
                        serde_json::Value::Null,
                    ))?;
                    self.followers.lock().await.remove(&job_id);
                    info!(job = %job_id, "queued job cancelled");
                } else {
                    // The dispatch task may already be past its flag
                    // checks and inside the sandbox; a kill covers that
                    // window and is a no-op for an unknown job.
                    self.runner.kill(job_id).await;
                }
                Ok(())
            }
            JobState::Running => {
                self.runner.kill(job_id).await;
                Ok(())
            }
            // Terminal states are final; nothing to do.
            _ => Ok(()),
        }
    }

    /// Dispatch queued jobs while slots and eligible requesters remain.
    ///
    /// Boxed: `dispatch` re-pumps when it finishes, so an unboxed
    /// future type here would be defined in terms of itself.
    fn pump(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                    return;
                };
                let picked = {
                    let mut state = self.state.lock().await;
                    state.next_eligible(self.config.per_requester_running)
                };
                let Some((requester, job_id)) = picked else {
                    return;
                };
                let scheduler = Arc::clone(&self);
                tokio::spawn(async move {
                    scheduler.dispatch(requester, job_id, permit).await;
                });
            }
        })
    }

    async fn dispatch(
        self: Arc<Self>,
        requester: Subject,
        job_id: JobId,
        permit: OwnedSemaphorePermit,
    ) {
        self.run_job(&requester, job_id).await;

        {
            let mut state = self.state.lock().await;
            state.release(&requester);
            state.cancelled.remove(&job_id);
        }
        self.followers.lock().await.remove(&job_id);
        drop(permit);
        Arc::clone(&self).pump().await;
    }

    async fn run_job(&self, requester: &Subject, job_id: JobId) {
        let mut record = match self.store.job(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(job = %job_id, "dispatched job missing from store");
                return;
            }
            Err(e) => {
                error!(job = %job_id, error = %e, "failed to load dispatched job");
                return;
            }
        };

        // Cancelled between admission and dispatch.
        let cancelled_early = self.state.lock().await.cancelled.contains(&job_id);
        if cancelled_early || record.state.is_terminal() {
            if !record.state.is_terminal() {
                self.finish(&mut record, JobOutcome::Cancelled, Vec::new())
                    .await;
            }
            return;
        }

        if let Err(e) = record.mark_running() {
            error!(job = %job_id, error = %e, "invalid dispatch transition");
            return;
        }
        if let Err(e) = self.store.update_job(&record).await {
            error!(job = %job_id, error = %e, "failed to persist running state");
            return;
        }
        // A cancel can land while the Running write is in flight: it
        // sees Queued, misses the queue, and sets the flag. Re-check
        // now that Running is persisted, before any sandbox exists.
        if self.state.lock().await.cancelled.contains(&job_id) {
            self.finish(&mut record, JobOutcome::Cancelled, Vec::new())
                .await;
            return;
        }
        if let Err(audit_err) = self.audit.append(&AuditRecord::now(
            requester.clone(),
            AuditAction::JobStarted,
            job_id.to_string(),
            AuditOutcome::Ok,
            serde_json::Value::Null,
        )) {
            // No sandbox without an audited start.
            let reason = FailureReason::Infrastructure(format!("audit: {audit_err}"));
            self.finish(&mut record, JobOutcome::Failed(reason), Vec::new())
                .await;
            return;
        }

        let bundle = match self.materialize_with_retry(job_id, requester, &record).await {
            Ok(bundle) => bundle,
            Err(reason) => {
                self.finish(&mut record, JobOutcome::Failed(reason), Vec::new())
                    .await;
                return;
            }
        };

        let (line_tx, line_rx) = mpsc::channel(FOLLOW_CHANNEL_CAPACITY);
        let collector = self.spawn_collector(job_id, line_rx).await;

        let request = RunRequest {
            job_id,
            spec: record.spec.clone(),
            timeout: Duration::from_secs(self.config.job_timeout_secs),
        };
        // The runner owns its own timeout; this outer window only fires
        // when the runner itself stops responding.
        let liveness_window = Duration::from_secs(
            self.config
                .job_timeout_secs
                .saturating_add(self.config.liveness_grace_secs),
        );
        let run = self.runner.run(request, bundle, line_tx);
        let outcome = match tokio::time::timeout(liveness_window, run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(job = %job_id, error = %e, "sandbox run failed");
                JobOutcome::Failed(FailureReason::Infrastructure(e.to_string()))
            }
            Err(_) => {
                warn!(job = %job_id, "runner unresponsive past liveness window");
                self.runner.kill(job_id).await;
                JobOutcome::Failed(FailureReason::RunnerLost)
            }
        };

        let output = match tokio::time::timeout(Duration::from_secs(2), collector).await {
            Ok(Ok(lines)) => lines,
            _ => Vec::new(),
        };
        self.finish(&mut record, outcome, output).await;
    }

    async fn materialize_with_retry(
        &self,
        job_id: JobId,
        requester: &Subject,
        record: &JobRecord,
    ) -> Result<crate::vault::CredentialBundle, FailureReason> {
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut last_err = String::new();
        for attempt in 0..=self.config.dispatch_retries {
            match self
                .vault
                .materialize(job_id, requester, &record.secret_refs)
                .await
            {
                Ok(bundle) => return Ok(bundle),
                // Denials are final; the sandbox is never created.
                Err(VaultError::Denied { secret_id, reason }) => {
                    return Err(FailureReason::Authorization(format!(
                        "secret {secret_id}: {reason}"
                    )));
                }
                Err(VaultError::NotFound(secret_id)) => {
                    return Err(FailureReason::Authorization(format!(
                        "secret {secret_id} does not exist"
                    )));
                }
                Err(VaultError::Validation(msg)) => {
                    return Err(FailureReason::Authorization(msg));
                }
                Err(e) => {
                    last_err = e.to_string();
                    if attempt < self.config.dispatch_retries {
                        warn!(job = %job_id, error = %last_err, attempt, "materialize failed, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        Err(FailureReason::Infrastructure(format!(
            "materialize failed after retries: {last_err}"
        )))
    }

    /// Forward run output to followers and collect it for persistence.
    async fn spawn_collector(
        &self,
        job_id: JobId,
        mut line_rx: mpsc::Receiver<OutputLine>,
    ) -> tokio::task::JoinHandle<Vec<OutputLine>> {
        let broadcast_tx = self.followers.lock().await.get(&job_id).cloned();
        tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(line) = line_rx.recv().await {
                if let Some(tx) = &broadcast_tx {
                    // A send error just means nobody is following.
                    let _ = tx.send(line.clone());
                }
                lines.push(line);
            }
            lines
        })
    }

    async fn finish(&self, record: &mut JobRecord, outcome: JobOutcome, output: Vec<OutputLine>) {
        let action = match &outcome {
            JobOutcome::Succeeded => AuditAction::JobSucceeded,
            JobOutcome::Failed(_) => AuditAction::JobFailed,
            JobOutcome::Cancelled => AuditAction::JobCancelled,
        };
        let details = match &outcome {
            JobOutcome::Failed(reason) => serde_json::json!({ "reason": reason }),
            _ => serde_json::Value::Null,
        };
        let audit_outcome = match &outcome {
            JobOutcome::Failed(FailureReason::Authorization(_)) => AuditOutcome::Denied,
            JobOutcome::Failed(_) => AuditOutcome::Error,
            _ => AuditOutcome::Ok,
        };

        record.output = output;
        if let Err(e) = record.complete(outcome) {
            error!(job = %record.id, error = %e, "invalid terminal transition");
            return;
        }
        if let Err(audit_err) = self.audit.append(&AuditRecord::now(
            record.requester.clone(),
            action,
            record.id.to_string(),
            audit_outcome,
            details,
        )) {
            // The run already happened; the outcome stands, annotated.
            record
                .annotations
                .push(format!("terminal audit append failed: {audit_err}"));
            error!(job = %record.id, error = %audit_err, "terminal audit append failed");
        }
        if let Err(e) = self.store.update_job(record).await {
            error!(job = %record.id, error = %e, "failed to persist terminal state");
        }
        info!(job = %record.id, state = ?record.state, "job finished");
    }
}
