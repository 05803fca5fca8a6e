//! Storage backends.
//!
//! A backend stores opaque JSON documents under an [`EntityKey`] and owns the
//! two atomic primitives the store relies on: insert-if-absent and
//! compare-and-swap on the record revision.

mod memory;
mod postgres;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::entity::{Entity, EntityKey, EntityKind, Status};
use crate::error::Result;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// A stored entity document plus the columns backends index on.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: EntityKey,
    pub id: String,
    pub revision: u64,
    pub status: Status,
    pub modified_time: DateTime<Utc>,
    pub value: Value,
}

impl Record {
    pub fn encode<E: Entity>(entity: &E) -> Result<Self> {
        let meta = entity.meta();
        Ok(Self {
            key: entity.key(),
            id: meta.id.clone(),
            revision: meta.revision,
            status: meta.status,
            modified_time: meta.modified_time.unwrap_or_else(Utc::now),
            value: serde_json::to_value(entity)?,
        })
    }

    /// The stored document with the authoritative revision patched in.
    pub fn document(&self) -> Value {
        let mut value = self.value.clone();
        if let Some(object) = value.as_object_mut() {
            object.insert("revision".to_string(), Value::from(self.revision));
        }
        value
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Insert a new record and return its revision.
    ///
    /// Fails with `AlreadyExists` if a record under the key is not `DELETED`.
    /// A `DELETED` tombstone is overwritten and the revision keeps counting.
    async fn insert(&self, record: &Record) -> Result<u64>;

    async fn get(&self, key: &EntityKey) -> Result<Option<Record>>;

    /// All records of a kind, optionally restricted to one organization,
    /// ordered by organization then name.
    async fn list(&self, kind: EntityKind, organization_id: Option<&str>) -> Result<Vec<Record>>;

    /// Replace the record if it still has `record.id` and its stored revision
    /// equals `expected_revision`. Returns the new revision.
    ///
    /// A record under the key with another ID is a re-created entity; the
    /// write fails with `NotFound`.
    async fn compare_and_swap(&self, expected_revision: u64, record: &Record) -> Result<u64>;

    async fn remove(&self, key: &EntityKey) -> Result<()>;
}
