//! SQLite-backed primary store via `sqlx`.
//!
//! Secrets and grants get real columns; jobs are stored as one JSON
//! document per row with the state mirrored into its own column.
//! `secret_with_grants` runs inside a transaction so revoke can never
//! interleave with a materialize authorization read.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::types::{Action, JobId, SecretId, Subject, Timestamp};
use crate::vault::crypto::EnvelopeCiphertext;

use super::{GrantRecord, JobRecord, SecretMeta, SecretRecord, Store, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS secrets (
    id         TEXT PRIMARY KEY,
    owner      TEXT NOT NULL,
    name       TEXT NOT NULL,
    service    TEXT,
    envelope   TEXT NOT NULL,
    key_ref    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    revoked_at TEXT
);
CREATE TABLE IF NOT EXISTS grants (
    secret_id  TEXT NOT NULL,
    subject    TEXT NOT NULL,
    actions    TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_grants_secret_subject ON grants(secret_id, subject);
CREATE TABLE IF NOT EXISTS jobs (
    id        TEXT PRIMARY KEY,
    requester TEXT NOT NULL,
    state     TEXT NOT NULL,
    record    TEXT NOT NULL
);
"#;

/// SQLite [`Store`] implementation.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn parse_timestamp(raw: &str) -> Result<Timestamp, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

fn secret_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SecretRecord, StoreError> {
    let id: String = row.try_get("id").map_err(unavailable)?;
    let owner: String = row.try_get("owner").map_err(unavailable)?;
    let name: String = row.try_get("name").map_err(unavailable)?;
    let service: Option<String> = row.try_get("service").map_err(unavailable)?;
    let envelope_raw: String = row.try_get("envelope").map_err(unavailable)?;
    let key_ref: String = row.try_get("key_ref").map_err(unavailable)?;
    let created_at: String = row.try_get("created_at").map_err(unavailable)?;
    let revoked_at: Option<String> = row.try_get("revoked_at").map_err(unavailable)?;

    let envelope: EnvelopeCiphertext = serde_json::from_str(&envelope_raw)
        .map_err(|e| StoreError::Corrupt(format!("envelope: {e}")))?;

    Ok(SecretRecord {
        id: SecretId::parse(&id).ok_or_else(|| StoreError::Corrupt(format!("secret id '{id}'")))?,
        owner: Subject::new(owner),
        name,
        service,
        envelope,
        key_ref,
        created_at: parse_timestamp(&created_at)?,
        revoked_at: revoked_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn grant_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<GrantRecord, StoreError> {
    let secret_id: String = row.try_get("secret_id").map_err(unavailable)?;
    let subject: String = row.try_get("subject").map_err(unavailable)?;
    let actions_raw: String = row.try_get("actions").map_err(unavailable)?;
    let expires_at: Option<String> = row.try_get("expires_at").map_err(unavailable)?;
    let created_at: String = row.try_get("created_at").map_err(unavailable)?;

    let actions: Vec<Action> = serde_json::from_str(&actions_raw)
        .map_err(|e| StoreError::Corrupt(format!("actions: {e}")))?;

    Ok(GrantRecord {
        secret_id: SecretId::parse(&secret_id)
            .ok_or_else(|| StoreError::Corrupt(format!("secret id '{secret_id}'")))?,
        subject: Subject::new(subject),
        actions,
        expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_secret(&self, record: SecretRecord) -> Result<(), StoreError> {
        let envelope = serde_json::to_string(&record.envelope)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO secrets (id, owner, name, service, envelope, key_ref, created_at, revoked_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.owner.as_str())
        .bind(&record.name)
        .bind(&record.service)
        .bind(envelope)
        .bind(&record.key_ref)
        .bind(record.created_at.to_rfc3339())
        .bind(record.revoked_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(StoreError::Conflict(format!(
                "secret {} already exists",
                record.id
            ))),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn secret(&self, id: SecretId) -> Result<Option<SecretRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM secrets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(secret_from_row).transpose()
    }

    async fn secret_with_grants(
        &self,
        id: SecretId,
        subject: &Subject,
    ) -> Result<Option<(SecretRecord, Vec<GrantRecord>)>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let row = sqlx::query("SELECT * FROM secrets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;
        let Some(row) = row else {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(None);
        };
        let record = secret_from_row(&row)?;

        let grant_rows = sqlx::query("SELECT * FROM grants WHERE secret_id = ? AND subject = ?")
            .bind(id.to_string())
            .bind(subject.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;

        let grants = grant_rows
            .iter()
            .map(grant_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((record, grants)))
    }

    async fn list_secrets(&self, owner: &Subject) -> Result<Vec<SecretMeta>, StoreError> {
        let rows = sqlx::query("SELECT * FROM secrets WHERE owner = ? ORDER BY created_at")
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter()
            .map(|row| secret_from_row(row).map(|record| record.meta()))
            .collect()
    }

    async fn revoke_secret(&self, id: SecretId, at: Timestamp) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE secrets SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
                .bind(at.to_rfc3339())
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Already revoked still counts as known; only a missing row is false.
        let exists = sqlx::query("SELECT id FROM secrets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(exists.is_some())
    }

    async fn delete_secret(&self, id: SecretId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM grants WHERE secret_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        sqlx::query("DELETE FROM secrets WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn insert_grant(&self, record: GrantRecord) -> Result<(), StoreError> {
        let actions = serde_json::to_string(&record.actions)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO grants (secret_id, subject, actions, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.secret_id.to_string())
        .bind(record.subject.as_str())
        .bind(actions)
        .bind(record.expires_at.map(|t| t.to_rfc3339()))
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete_grants(
        &self,
        secret_id: SecretId,
        subject: &Subject,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM grants WHERE secret_id = ? AND subject = ?")
            .bind(secret_id.to_string())
            .bind(subject.as_str())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn insert_job(&self, record: JobRecord) -> Result<(), StoreError> {
        let document =
            serde_json::to_string(&record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let state =
            serde_json::to_string(&record.state).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO jobs (id, requester, state, record) VALUES (?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.requester.as_str())
        .bind(state)
        .bind(document)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(StoreError::Conflict(format!(
                "job {} already exists",
                record.id
            ))),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let document: String = row.try_get("record").map_err(unavailable)?;
        serde_json::from_str(&document).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        let document =
            serde_json::to_string(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let state =
            serde_json::to_string(&record.state).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let result = sqlx::query("UPDATE jobs SET state = ?, record = ? WHERE id = ?")
            .bind(state)
            .bind(document)
            .bind(record.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("job {} not found", record.id)));
        }
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
