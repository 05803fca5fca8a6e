//! Entity handler contract.
//!
//! A handler owns the external side effects for one entity kind. The
//! controller decides which callback to run from the entity's stored state;
//! the handler converges reality and persists the observed outcome.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cirrus_store::{Entity, EntityKind, EntityMeta, Status};

/// Trait for per-kind entity handlers.
#[async_trait]
pub trait EntityHandler: Send + Sync + 'static {
    /// The entity kind this handler manages.
    type Entity: Entity;

    fn kind(&self) -> EntityKind {
        <Self::Entity as Entity>::KIND
    }

    /// First reconciliation of a freshly stored entity.
    async fn add(&self, entity: Self::Entity) -> Result<()>;

    async fn update(&self, entity: Self::Entity) -> Result<()>;

    /// Tear down the external object, then remove the record.
    async fn delete(&self, entity: Self::Entity) -> Result<()>;

    /// Retry or recovery for an entity whose last action failed.
    async fn error(&self, entity: Self::Entity) -> Result<()>;

    /// Entities of one organization that need processing.
    ///
    /// Implementations diff stored entities against external state and may
    /// persist observed status changes before returning.
    async fn sync(&self, organization_id: &str, resync_period: Duration) -> Result<Vec<Self::Entity>>;
}

/// The callback an entity is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Update,
    Delete,
    Error,
}

impl Action {
    /// Routing rule: the delete flag wins, then `INITIALIZED` and `ERROR`
    /// get their own callbacks, everything else is an update.
    pub fn for_entity(meta: &EntityMeta) -> Self {
        if meta.delete {
            return Action::Delete;
        }
        match meta.status {
            Status::Initialized => Action::Add,
            Status::Error => Action::Error,
            _ => Action::Update,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Error => "error",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run the callback `action` selects.
pub(crate) async fn dispatch<E: Entity>(
    handler: &dyn EntityHandler<Entity = E>,
    action: Action,
    entity: E,
) -> Result<()> {
    match action {
        Action::Add => handler.add(entity).await,
        Action::Update => handler.update(entity).await,
        Action::Delete => handler.delete(entity).await,
        Action::Error => handler.error(entity).await,
    }
}
