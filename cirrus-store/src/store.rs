//! Typed entity store over a [`Backend`].

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::backend::{Backend, MemoryBackend, PostgresBackend, Record, SqliteBackend};
use crate::config::{BackendConfig, BackendKind};
use crate::entity::{Entity, EntityKey, EntityMeta};
use crate::error::{Result, StoreError};
use crate::filter::Options;

/// Shared handle to the entity store. Cloning is cheap.
#[derive(Clone)]
pub struct EntityStore {
    backend: Arc<dyn Backend>,
}

impl EntityStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open the backend described by `config`.
    pub async fn open(config: &BackendConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Sqlite => Arc::new(SqliteBackend::from_path(&config.address).await?),
            BackendKind::Postgres => Arc::new(
                PostgresBackend::connect(
                    &config.address,
                    &config.bucket,
                    &config.username,
                    &config.password,
                )
                .await?,
            ),
        };
        Ok(Self::new(backend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a new entity. Assigns its ID, timestamps and first revision.
    pub async fn add<E: Entity>(&self, entity: &mut E) -> Result<String> {
        precondition(entity.meta())?;

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        {
            let meta = entity.meta_mut();
            meta.id = id.clone();
            meta.created_time = Some(now);
            meta.modified_time = Some(now);
        }

        let record = Record::encode(entity)?;
        let revision = self.backend.insert(&record).await?;
        entity.meta_mut().revision = revision;

        debug!(key = %record.key, %id, revision, "Added entity");
        Ok(id)
    }

    /// Compare-and-swap write. Succeeds only if the stored revision equals
    /// `expected_revision`; on success the entity carries the new revision.
    /// A record that was deleted and re-created under the same name is a
    /// different entity, so writing an old copy fails with `NotFound`.
    pub async fn update<E: Entity>(&self, expected_revision: u64, entity: &mut E) -> Result<u64> {
        if entity.meta().organization_id.is_empty() {
            return Err(StoreError::InvalidArgument(
                "organization ID is required".to_string(),
            ));
        }

        entity.meta_mut().modified_time = Some(Utc::now());
        let record = Record::encode(entity)?;
        let revision = self.backend.compare_and_swap(expected_revision, &record).await?;
        entity.meta_mut().revision = revision;

        debug!(key = %record.key, status = %record.status, revision, "Updated entity");
        Ok(revision)
    }

    /// Persist the outcome of a handler step.
    ///
    /// An `Err` moves the entity to `ERROR` and appends the message (alternate
    /// form, so `anyhow` chains are kept) to its reason list; an `Ok` persists
    /// the entity as-is. A failed write is logged, not returned.
    pub async fn update_with_error<E, T, X>(&self, entity: &mut E, outcome: &std::result::Result<T, X>)
    where
        E: Entity,
        X: Display,
    {
        if let Err(e) = outcome {
            entity.meta_mut().set_error(format!("{e:#}"));
        }
        let revision = entity.meta().revision;
        if let Err(e) = self.update(revision, entity).await {
            error!(key = %entity.key(), error = %e, "Failed to persist entity outcome");
        }
    }

    /// Flag the entity for deletion and persist it as `DELETING`.
    pub async fn soft_delete<E: Entity>(&self, entity: &mut E) -> Result<u64> {
        entity.meta_mut().mark_deleting();
        let revision = entity.meta().revision;
        self.update(revision, entity).await
    }

    /// Remove the record entirely.
    pub async fn delete<E: Entity>(&self, organization_id: &str, name: &str) -> Result<()> {
        let key = EntityKey::new(organization_id, E::KIND, name);
        self.backend.remove(&key).await?;
        debug!(%key, "Deleted entity");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Like [`find`](Self::find), but a miss is `NotFound`.
    pub async fn get<E: Entity>(&self, organization_id: &str, name: &str, opts: &Options) -> Result<E> {
        self.find(organization_id, name, opts).await?.ok_or_else(|| {
            StoreError::NotFound(EntityKey::new(organization_id, E::KIND, name).to_string())
        })
    }

    /// Look up one entity. A record rejected by the filter counts as absent.
    pub async fn find<E: Entity>(
        &self,
        organization_id: &str,
        name: &str,
        opts: &Options,
    ) -> Result<Option<E>> {
        let key = EntityKey::new(organization_id, E::KIND, name);
        match self.backend.get(&key).await? {
            Some(record) => decode(&record, opts),
            None => Ok(None),
        }
    }

    pub async fn list<E: Entity>(&self, organization_id: &str, opts: &Options) -> Result<Vec<E>> {
        if organization_id.is_empty() {
            return Err(StoreError::InvalidArgument(
                "organization ID is required".to_string(),
            ));
        }
        let records = self.backend.list(E::KIND, Some(organization_id)).await?;
        decode_all(&records, opts)
    }

    /// List across all organizations.
    pub async fn list_global<E: Entity>(&self, opts: &Options) -> Result<Vec<E>> {
        let records = self.backend.list(E::KIND, None).await?;
        decode_all(&records, opts)
    }
}

fn precondition(meta: &EntityMeta) -> Result<()> {
    if meta.organization_id.is_empty() {
        return Err(StoreError::InvalidArgument(
            "organization ID is required".to_string(),
        ));
    }
    let valid = !meta.name.is_empty()
        && meta
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(StoreError::InvalidName(meta.name.clone()));
    }
    Ok(())
}

fn decode<E: Entity>(record: &Record, opts: &Options) -> Result<Option<E>> {
    let document = record.document();
    if !opts.matches(&document)? {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(document)?))
}

fn decode_all<E: Entity>(records: &[Record], opts: &Options) -> Result<Vec<E>> {
    let mut entities = Vec::with_capacity(records.len());
    for record in records {
        if let Some(entity) = decode(record, opts)? {
            entities.push(entity);
        }
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, Status, Tags};
    use crate::filter::{Filter, FilterStat, FilterVerb};
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Function {
        #[serde(flatten)]
        meta: EntityMeta,
        runtime: String,
    }

    impl Entity for Function {
        const KIND: EntityKind = EntityKind::Function;

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    fn make_function(org: &str, name: &str) -> Function {
        Function {
            meta: EntityMeta::new(org, name),
            runtime: "python3".to_string(),
        }
    }

    async fn sqlite_store() -> (EntityStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cirrus.db");
        let store = EntityStore::open(&BackendConfig::sqlite(path.to_string_lossy()))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_add_assigns_identity() {
        let store = EntityStore::in_memory();
        let mut f = make_function("acme", "hello");

        let id = store.add(&mut f).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(f.meta.id, id);
        assert_eq!(f.meta.revision, 1);
        assert!(f.meta.created_time.is_some());

        let fetched: Function = store.get("acme", "hello", &Options::default()).await.unwrap();
        assert_eq!(fetched.meta.id, id);
        assert_eq!(fetched.meta.status, Status::Initialized);
        assert_eq!(fetched.runtime, "python3");
    }

    #[tokio::test]
    async fn test_add_preconditions() {
        let store = EntityStore::in_memory();

        let err = store.add(&mut make_function("acme", "bad name!")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));

        let err = store.add(&mut make_function("", "ok")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_name_unique_per_org_and_kind() {
        let (store, _dir) = sqlite_store().await;
        store.add(&mut make_function("acme", "hello")).await.unwrap();

        let err = store.add(&mut make_function("acme", "hello")).await.unwrap_err();
        assert!(err.is_conflict());

        // Same name in another organization is fine.
        store.add(&mut make_function("globex", "hello")).await.unwrap();
    }

    #[tokio::test]
    async fn test_revision_increases_and_stale_write_fails() {
        let (store, _dir) = sqlite_store().await;
        let mut f = make_function("acme", "hello");
        store.add(&mut f).await.unwrap();

        let mut stale = f.clone();

        f.meta.status = Status::Creating;
        let r2 = store.update(f.meta.revision, &mut f).await.unwrap();
        f.meta.status = Status::Ready;
        let r3 = store.update(f.meta.revision, &mut f).await.unwrap();
        assert!(r2 > 1 && r3 > r2);

        stale.meta.status = Status::Error;
        let err = store.update(stale.meta.revision, &mut stale).await.unwrap_err();
        assert!(matches!(err, StoreError::RevisionMismatch { .. }));

        let stored: Function = store.get("acme", "hello", &Options::default()).await.unwrap();
        assert_eq!(stored.meta.status, Status::Ready);
        assert_eq!(stored.meta.revision, r3);
    }

    #[tokio::test]
    async fn test_concurrent_updates_exactly_one_wins() {
        let store = EntityStore::in_memory();
        let mut f = make_function("acme", "hello");
        store.add(&mut f).await.unwrap();
        let revision = f.meta.revision;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let mut copy = f.clone();
            handles.push(tokio::spawn(async move {
                copy.runtime = format!("runtime-{i}");
                store.update(revision, &mut copy).await.is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_update_with_error() {
        let store = EntityStore::in_memory();
        let mut f = make_function("acme", "hello");
        store.add(&mut f).await.unwrap();

        let failed: std::result::Result<(), String> = Err("image build failed".to_string());
        store.update_with_error(&mut f, &failed).await;

        let stored: Function = store.get("acme", "hello", &Options::default()).await.unwrap();
        assert_eq!(stored.meta.status, Status::Error);
        assert_eq!(stored.meta.reason, vec!["image build failed"]);

        // Ok persists as-is.
        f.meta.status = Status::Ready;
        f.meta.reason.clear();
        let ok: std::result::Result<(), String> = Ok(());
        store.update_with_error(&mut f, &ok).await;
        let stored: Function = store.get("acme", "hello", &Options::default()).await.unwrap();
        assert_eq!(stored.meta.status, Status::Ready);
        assert!(stored.meta.reason.is_empty());
    }

    #[tokio::test]
    async fn test_update_with_error_swallows_stale_write() {
        let store = EntityStore::in_memory();
        let mut f = make_function("acme", "hello");
        store.add(&mut f).await.unwrap();

        let mut stale = f.clone();
        store.update(f.meta.revision, &mut f).await.unwrap();

        let failed: std::result::Result<(), &str> = Err("boom");
        store.update_with_error(&mut stale, &failed).await;

        let stored: Function = store.get("acme", "hello", &Options::default()).await.unwrap();
        assert_eq!(stored.meta.status, Status::Initialized);
    }

    #[tokio::test]
    async fn test_soft_delete_then_delete() {
        let (store, _dir) = sqlite_store().await;
        let mut f = make_function("acme", "hello");
        store.add(&mut f).await.unwrap();

        store.soft_delete(&mut f).await.unwrap();
        let stored: Function = store.get("acme", "hello", &Options::default()).await.unwrap();
        assert!(stored.meta.delete);
        assert_eq!(stored.meta.status, Status::Deleting);

        let live: Vec<Function> = store
            .list("acme", &Options::filtered(Filter::exists()))
            .await
            .unwrap();
        assert!(live.is_empty());

        store.delete::<Function>("acme", "hello").await.unwrap();
        assert!(
            store
                .find::<Function>("acme", "hello", &Options::default())
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .delete::<Function>("acme", "hello")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    async fn assert_stale_copy_cannot_overwrite_recreated(store: EntityStore) {
        let mut old = make_function("acme", "hello");
        store.add(&mut old).await.unwrap();
        let mut stale = old.clone();
        store.delete::<Function>("acme", "hello").await.unwrap();

        let mut recreated = make_function("acme", "hello");
        recreated.runtime = "go".to_string();
        store.add(&mut recreated).await.unwrap();
        assert_eq!(recreated.meta.revision, stale.meta.revision);

        stale.runtime = "node".to_string();
        let err = store.update(stale.meta.revision, &mut stale).await.unwrap_err();
        assert!(err.is_not_found(), "{} backend: {err}", store.backend_name());

        let stored: Function = store.get("acme", "hello", &Options::default()).await.unwrap();
        assert_eq!(stored.meta.id, recreated.meta.id);
        assert_eq!(stored.runtime, "go");
        assert_eq!(stored.meta.revision, recreated.meta.revision);

        // The live copy still writes.
        recreated.meta.status = Status::Ready;
        store.update(recreated.meta.revision, &mut recreated).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_copy_of_deleted_entity_is_rejected() {
        assert_stale_copy_cannot_overwrite_recreated(EntityStore::in_memory()).await;

        let (store, _dir) = sqlite_store().await;
        assert_stale_copy_cannot_overwrite_recreated(store).await;
    }

    #[tokio::test]
    async fn test_deleted_tombstone_frees_name() {
        let store = EntityStore::in_memory();
        let mut f = make_function("acme", "hello");
        store.add(&mut f).await.unwrap();

        f.meta.status = Status::Deleted;
        let tombstone_rev = store.update(f.meta.revision, &mut f).await.unwrap();

        let mut again = make_function("acme", "hello");
        store.add(&mut again).await.unwrap();
        assert!(again.meta.revision > tombstone_rev);
        assert_ne!(again.meta.id, f.meta.id);
    }

    #[tokio::test]
    async fn test_list_filters_and_scoping() {
        let (store, _dir) = sqlite_store().await;

        let mut tags = Tags::new();
        tags.insert("team".to_string(), "data".to_string());
        let mut tagged = make_function("acme", "a");
        tagged.meta = tagged.meta.with_tags(tags);
        store.add(&mut tagged).await.unwrap();
        store.add(&mut make_function("acme", "b")).await.unwrap();
        store.add(&mut make_function("globex", "c")).await.unwrap();

        let all: Vec<Function> = store.list("acme", &Options::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let team: Vec<Function> = store
            .list(
                "acme",
                &Options::filtered(Filter::everything().with_tag("team", "data")),
            )
            .await
            .unwrap();
        assert_eq!(team.len(), 1);
        assert_eq!(team[0].meta.name, "a");

        let by_runtime: Vec<Function> = store
            .list_global(&Options::filtered(Filter::everything().add(FilterStat::extra(
                "runtime",
                FilterVerb::Equal,
                "python3",
            ))))
            .await
            .unwrap();
        assert_eq!(by_runtime.len(), 3);

        assert!(store.list::<Function>("", &Options::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_filtered_get_is_not_found() {
        let store = EntityStore::in_memory();
        store.add(&mut make_function("acme", "hello")).await.unwrap();

        let ready_only = Options::filtered(
            Filter::everything().add(FilterStat::status_in(&[Status::Ready])),
        );
        let err = store
            .get::<Function>("acme", "hello", &ready_only)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
