use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Backend, Record};
use crate::entity::{EntityKey, EntityKind, Status};
use crate::error::{Result, StoreError};

/// Process-local backend for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<EntityKey, Record>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, record: &Record) -> Result<u64> {
        let mut records = self.records.write().await;
        let revision = match records.get(&record.key) {
            Some(existing) if existing.status != Status::Deleted => {
                return Err(StoreError::AlreadyExists(record.key.to_string()));
            }
            Some(tombstone) => tombstone.revision + 1,
            None => 1,
        };
        let mut stored = record.clone();
        stored.revision = revision;
        records.insert(record.key.clone(), stored);
        Ok(revision)
    }

    async fn get(&self, key: &EntityKey) -> Result<Option<Record>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn list(&self, kind: EntityKind, organization_id: Option<&str>) -> Result<Vec<Record>> {
        let records = self.records.read().await;
        let mut matched: Vec<Record> = records
            .values()
            .filter(|r| r.key.kind == kind)
            .filter(|r| organization_id.is_none_or(|org| r.key.organization_id == org))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matched)
    }

    async fn compare_and_swap(&self, expected_revision: u64, record: &Record) -> Result<u64> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&record.key)
            .filter(|stored| stored.id == record.id)
            .ok_or_else(|| StoreError::NotFound(record.key.to_string()))?;
        if stored.revision != expected_revision {
            return Err(StoreError::RevisionMismatch {
                key: record.key.to_string(),
                expected: expected_revision,
                actual: stored.revision,
            });
        }
        let revision = stored.revision + 1;
        *stored = record.clone();
        stored.revision = revision;
        Ok(revision)
    }

    async fn remove(&self, key: &EntityKey) -> Result<()> {
        match self.records.write().await.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }
}
