//! In-memory store for tests and single-node development runs.
//!
//! One `RwLock` over the whole state: every method sees one consistent
//! snapshot, which gives `secret_with_grants` its required atomicity
//! for free.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{JobId, SecretId, Subject, Timestamp};

use super::{GrantRecord, JobRecord, SecretMeta, SecretRecord, Store, StoreError};

#[derive(Default)]
struct State {
    secrets: HashMap<SecretId, SecretRecord>,
    grants: Vec<GrantRecord>,
    jobs: HashMap<JobId, JobRecord>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_secret(&self, record: SecretRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.secrets.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!(
                "secret {} already exists",
                record.id
            )));
        }
        state.secrets.insert(record.id, record);
        Ok(())
    }

    async fn secret(&self, id: SecretId) -> Result<Option<SecretRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.secrets.get(&id).cloned())
    }

    async fn secret_with_grants(
        &self,
        id: SecretId,
        subject: &Subject,
    ) -> Result<Option<(SecretRecord, Vec<GrantRecord>)>, StoreError> {
        let state = self.state.read().await;
        let Some(record) = state.secrets.get(&id) else {
            return Ok(None);
        };
        let grants = state
            .grants
            .iter()
            .filter(|grant| grant.secret_id == id && &grant.subject == subject)
            .cloned()
            .collect();
        Ok(Some((record.clone(), grants)))
    }

    async fn list_secrets(&self, owner: &Subject) -> Result<Vec<SecretMeta>, StoreError> {
        let state = self.state.read().await;
        let mut metas: Vec<SecretMeta> = state
            .secrets
            .values()
            .filter(|record| &record.owner == owner)
            .map(SecretRecord::meta)
            .collect();
        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(metas)
    }

    async fn revoke_secret(&self, id: SecretId, at: Timestamp) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.secrets.get_mut(&id) {
            Some(record) => {
                if record.revoked_at.is_none() {
                    record.revoked_at = Some(at);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_secret(&self, id: SecretId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.secrets.remove(&id);
        state.grants.retain(|grant| grant.secret_id != id);
        Ok(())
    }

    async fn insert_grant(&self, record: GrantRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.grants.push(record);
        Ok(())
    }

    async fn delete_grants(
        &self,
        secret_id: SecretId,
        subject: &Subject,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .grants
            .retain(|grant| !(grant.secret_id == secret_id && &grant.subject == subject));
        Ok(())
    }

    async fn insert_job(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!(
                "job {} already exists",
                record.id
            )));
        }
        state.jobs.insert(record.id, record);
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::Conflict(format!("job {} not found", record.id))),
        }
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.jobs.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use super::*;
    use crate::types::{Action, CommandSpec};
    use crate::vault::crypto::EnvelopeCiphertext;
    use chrono::Utc;

    fn secret(owner: &str, name: &str) -> SecretRecord {
        SecretRecord {
            id: SecretId::generate(),
            owner: Subject::new(owner),
            name: name.to_owned(),
            service: None,
            envelope: EnvelopeCiphertext {
                ciphertext: vec![1, 2, 3],
                payload_nonce: vec![0; 12],
                wrapped_key: vec![4, 5, 6],
                key_nonce: vec![0; 12],
            },
            key_ref: "local-master-v1".to_owned(),
            created_at: Utc::now(),
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_secret() {
        let store = MemoryStore::new();
        let record = secret("alice", "npm-token");
        let id = record.id;
        store.insert_secret(record).await.expect("insert");

        let fetched = store.secret(id).await.expect("fetch").expect("present");
        assert_eq!(fetched.name, "npm-token");

        // Duplicate insert is a conflict.
        let dup = SecretRecord {
            id,
            ..secret("alice", "other")
        };
        assert!(store.insert_secret(dup).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_filters_grants_by_subject() {
        let store = MemoryStore::new();
        let record = secret("alice", "npm-token");
        let id = record.id;
        store.insert_secret(record).await.expect("insert");

        for subject in ["bob", "carol"] {
            store
                .insert_grant(GrantRecord {
                    secret_id: id,
                    subject: Subject::new(subject),
                    actions: vec![Action::UseInJob],
                    expires_at: None,
                    created_at: Utc::now(),
                })
                .await
                .expect("grant");
        }

        let (_, grants) = store
            .secret_with_grants(id, &Subject::new("bob"))
            .await
            .expect("snapshot")
            .expect("present");
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].subject, Subject::new("bob"));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_keeps_first_timestamp() {
        let store = MemoryStore::new();
        let record = secret("alice", "npm-token");
        let id = record.id;
        store.insert_secret(record).await.expect("insert");

        let first = Utc::now();
        assert!(store.revoke_secret(id, first).await.expect("revoke"));
        let later = first + chrono::Duration::hours(1);
        assert!(store.revoke_secret(id, later).await.expect("re-revoke"));

        let fetched = store.secret(id).await.expect("fetch").expect("present");
        assert_eq!(fetched.revoked_at, Some(first));

        assert!(!store
            .revoke_secret(SecretId::generate(), Utc::now())
            .await
            .expect("unknown id"));
    }

    #[tokio::test]
    async fn list_secrets_scoped_to_owner() {
        let store = MemoryStore::new();
        store
            .insert_secret(secret("alice", "one"))
            .await
            .expect("insert");
        store
            .insert_secret(secret("bob", "two"))
            .await
            .expect("insert");

        let listed = store
            .list_secrets(&Subject::new("alice"))
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "one");
    }

    #[tokio::test]
    async fn job_update_requires_existing_row() {
        let store = MemoryStore::new();
        let record = JobRecord::queued(
            Subject::new("alice"),
            CommandSpec {
                package: "left-pad".to_owned(),
                version: None,
                registry: None,
            },
            vec![],
        );
        assert!(store.update_job(&record).await.is_err());

        store.insert_job(record.clone()).await.expect("insert");
        let mut updated = record;
        updated.mark_running().expect("running");
        store.update_job(&updated).await.expect("update");

        let fetched = store
            .job(updated.id)
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(fetched.state, crate::types::JobState::Running);
    }
}
