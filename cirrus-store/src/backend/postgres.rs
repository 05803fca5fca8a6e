use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use tracing::info;

use super::{Backend, Record};
use crate::entity::{EntityKey, EntityKind};
use crate::error::{Result, StoreError};

/// Networked backend for multi-process deployments.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `postgres://{username}:{password}@{address}/{database}`
    /// and ensure the schema.
    pub async fn connect(
        address: &str,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let url = format!("postgres://{username}:{password}@{address}/{database}?sslmode=disable");
        let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;

        let backend = Self { pool };
        backend.migrate().await?;
        info!(%address, %database, "Connected to PostgreSQL entity store");
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
                revision BIGINT NOT NULL,
                status TEXT NOT NULL,
                modified_time TIMESTAMPTZ NOT NULL,
                value JSONB NOT NULL
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

fn row_to_record(row: &PgRow) -> Result<Record> {
    let organization_id: String = row.try_get("organization_id")?;
    let kind: String = row.try_get("kind")?;
    let name: String = row.try_get("name")?;
    let revision: i64 = row.try_get("revision")?;
    let status: String = row.try_get("status")?;
    let modified_time: DateTime<Utc> = row.try_get("modified_time")?;
    let Json(value): Json<Value> = row.try_get("value")?;

    Ok(Record {
        key: EntityKey::new(&organization_id, kind.parse()?, &name),
        id: row.try_get("id")?,
        revision: revision as u64,
        status: status.parse()?,
        modified_time,
        value,
    })
}

#[async_trait]
impl Backend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn insert(&self, record: &Record) -> Result<u64> {
        let row = sqlx::query(
            r#"
            INSERT INTO entities (key, id, organization_id, kind, name, revision, status, modified_time, value)
            VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8)
            ON CONFLICT (key) DO UPDATE SET
                id = EXCLUDED.id,
                revision = entities.revision + 1,
                status = EXCLUDED.status,
                modified_time = EXCLUDED.modified_time,
                value = EXCLUDED.value
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
        .bind(record.modified_time)
        .bind(Json(&record.value))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get::<i64, _>("revision")? as u64),
            None => Err(StoreError::AlreadyExists(record.key.to_string())),
        }
    }

    async fn get(&self, key: &EntityKey) -> Result<Option<Record>> {
        let row = sqlx::query("SELECT * FROM entities WHERE key = $1")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self, kind: EntityKind, organization_id: Option<&str>) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM entities
            WHERE kind = $1 AND ($2::TEXT IS NULL OR organization_id = $2)
            ORDER BY organization_id, name
            "#,
        )
        .bind(kind.as_str())
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn compare_and_swap(&self, expected_revision: u64, record: &Record) -> Result<u64> {
        let key = record.key.to_string();
        let row = sqlx::query(
            r#"
            UPDATE entities
            SET revision = revision + 1, status = $1, modified_time = $2, value = $3
            WHERE key = $4 AND id = $5 AND revision = $6
            RETURNING revision
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.modified_time)
        .bind(Json(&record.value))
        .bind(&key)
        .bind(&record.id)
        .bind(expected_revision as i64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(row.try_get::<i64, _>("revision")? as u64);
        }

        let current = sqlx::query("SELECT revision FROM entities WHERE key = $1 AND id = $2")
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
        let result = sqlx::query("DELETE FROM entities WHERE key = $1")
            .bind(key.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }
}
