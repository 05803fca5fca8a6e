//! cirrus entity store.
//!
//! Every managed object in cirrus is an entity: a kind-specific document
//! sharing a common base (identity, organization, status, revision, tags).
//! The [`EntityStore`] persists entities through a pluggable [`Backend`] and
//! guards writes with compare-and-swap on the record revision.

pub mod backend;
pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod store;

pub use backend::{Backend, MemoryBackend, PostgresBackend, Record, SqliteBackend};
pub use config::{BackendConfig, BackendKind};
pub use entity::{Entity, EntityKey, EntityKind, EntityMeta, Status, Tags};
pub use error::{Result, StoreError};
pub use filter::{Filter, FilterScope, FilterStat, FilterVerb, Options};
pub use store::EntityStore;
