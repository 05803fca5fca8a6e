use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::info;

use super::{Backend, Record};
use crate::entity::{EntityKey, EntityKind};
use crate::error::{Result, StoreError};

/// Embedded single-file backend.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database file at `path` and ensure the schema.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Internal(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let backend = Self { pool };
        backend.migrate().await?;
        info!(path = %path.display(), "Opened SQLite entity store");
        Ok(backend)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                key TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                revision INTEGER NOT NULL,
                status TEXT NOT NULL,
                modified_time TEXT NOT NULL,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entities_kind_org ON entities(kind, organization_id, name)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_record(row: &SqliteRow) -> Result<Record> {
    let organization_id: String = row.try_get("organization_id")?;
    let kind: String = row.try_get("kind")?;
    let name: String = row.try_get("name")?;
    let revision: i64 = row.try_get("revision")?;
    let status: String = row.try_get("status")?;
    let modified_time: String = row.try_get("modified_time")?;
    let value: String = row.try_get("value")?;

    Ok(Record {
        key: EntityKey::new(&organization_id, kind.parse()?, &name),
        id: row.try_get("id")?,
        revision: revision as u64,
        status: status.parse()?,
        modified_time: DateTime::parse_from_rfc3339(&modified_time)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Internal(format!("bad modified_time {modified_time:?}: {e}")))?,
        value: serde_json::from_str(&value)?,
    })
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert(&self, record: &Record) -> Result<u64> {
        let row = sqlx::query(
            r#"
            INSERT INTO entities (key, id, organization_id, kind, name, revision, status, modified_time, value)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                id = excluded.id,
                revision = entities.revision + 1,
                status = excluded.status,
                modified_time = excluded.modified_time,
                value = excluded.value
            WHERE entities.status = 'DELETED'
            RETURNING revision
            "#,
        )
        .bind(record.key.to_string())
        .bind(&record.id)
        .bind(&record.key.organization_id)
        .bind(record.key.kind.as_str())
        .bind(&record.key.name)
        .bind(record.status.as_str())
        .bind(record.modified_time.to_rfc3339())
        .bind(record.value.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get::<i64, _>("revision")? as u64),
            None => Err(StoreError::AlreadyExists(record.key.to_string())),
        }
    }

    async fn get(&self, key: &EntityKey) -> Result<Option<Record>> {
        let row = sqlx::query("SELECT * FROM entities WHERE key = ?")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self, kind: EntityKind, organization_id: Option<&str>) -> Result<Vec<Record>> {
        let rows = match organization_id {
            Some(org) => {
                sqlx::query(
                    "SELECT * FROM entities WHERE kind = ? AND organization_id = ? ORDER BY name",
                )
                .bind(kind.as_str())
                .bind(org)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM entities WHERE kind = ? ORDER BY organization_id, name",
                )
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_record).collect()
    }

    async fn compare_and_swap(&self, expected_revision: u64, record: &Record) -> Result<u64> {
        let key = record.key.to_string();
        let row = sqlx::query(
            r#"
            UPDATE entities
            SET revision = revision + 1, status = ?, modified_time = ?, value = ?
            WHERE key = ? AND id = ? AND revision = ?
            RETURNING revision
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.modified_time.to_rfc3339())
        .bind(record.value.to_string())
        .bind(&key)
        .bind(&record.id)
        .bind(expected_revision as i64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(row.try_get::<i64, _>("revision")? as u64);
        }

        // A record under the key with another ID is a different entity.
        let current = sqlx::query("SELECT revision FROM entities WHERE key = ? AND id = ?")
            .bind(&key)
            .bind(&record.id)
            .fetch_optional(&self.pool)
            .await?;
        match current {
            Some(row) => Err(StoreError::RevisionMismatch {
                key,
                expected: expected_revision,
                actual: row.try_get::<i64, _>("revision")? as u64,
            }),
            None => Err(StoreError::NotFound(key)),
        }
    }

    async fn remove(&self, key: &EntityKey) -> Result<()> {
        let result = sqlx::query("DELETE FROM entities WHERE key = ?")
            .bind(key.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }
}
