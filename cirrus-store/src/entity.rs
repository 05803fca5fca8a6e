//! Entity base model shared by every managed kind.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Free-form labels attached to an entity.
pub type Tags = BTreeMap<String, String>;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of an entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Stored, not yet seen by a handler
    Initialized,
    /// External provisioning in progress
    Creating,
    /// External update in progress
    Updating,
    /// External object exists and matches the record
    Ready,
    /// Last action failed, see `reason`
    Error,
    /// Teardown requested or in progress
    Deleting,
    /// Tombstone; the name may be reused
    Deleted,
    #[default]
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Initialized => "INITIALIZED",
            Status::Creating => "CREATING",
            Status::Updating => "UPDATING",
            Status::Ready => "READY",
            Status::Error => "ERROR",
            Status::Deleting => "DELETING",
            Status::Deleted => "DELETED",
            Status::Unknown => "UNKNOWN",
        }
    }

    /// Statuses that mean an external operation has not settled yet.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Status::Creating | Status::Updating | Status::Deleting)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZED" => Ok(Status::Initialized),
            "CREATING" => Ok(Status::Creating),
            "UPDATING" => Ok(Status::Updating),
            "READY" => Ok(Status::Ready),
            "ERROR" => Ok(Status::Error),
            "DELETING" => Ok(Status::Deleting),
            "DELETED" => Ok(Status::Deleted),
            "UNKNOWN" => Ok(Status::Unknown),
            other => Err(StoreError::Internal(format!("unknown status {other:?}"))),
        }
    }
}

impl From<Status> for serde_json::Value {
    fn from(status: Status) -> Self {
        serde_json::Value::String(status.as_str().to_string())
    }
}

// =============================================================================
// Kinds
// =============================================================================

/// Closed set of entity kinds known to the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "PascalCase")]
pub enum EntityKind {
    Function,
    Image,
    BaseImage,
    ServiceClass,
    ServiceInstance,
    ServiceBinding,
    Secret,
    Api,
    EventDriver,
    Subscription,
    Application,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Function => "Function",
            EntityKind::Image => "Image",
            EntityKind::BaseImage => "BaseImage",
            EntityKind::ServiceClass => "ServiceClass",
            EntityKind::ServiceInstance => "ServiceInstance",
            EntityKind::ServiceBinding => "ServiceBinding",
            EntityKind::Secret => "Secret",
            EntityKind::Api => "Api",
            EntityKind::EventDriver => "EventDriver",
            EntityKind::Subscription => "Subscription",
            EntityKind::Application => "Application",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Function" => Ok(EntityKind::Function),
            "Image" => Ok(EntityKind::Image),
            "BaseImage" => Ok(EntityKind::BaseImage),
            "ServiceClass" => Ok(EntityKind::ServiceClass),
            "ServiceInstance" => Ok(EntityKind::ServiceInstance),
            "ServiceBinding" => Ok(EntityKind::ServiceBinding),
            "Secret" => Ok(EntityKind::Secret),
            "Api" => Ok(EntityKind::Api),
            "EventDriver" => Ok(EntityKind::EventDriver),
            "Subscription" => Ok(EntityKind::Subscription),
            "Application" => Ok(EntityKind::Application),
            other => Err(StoreError::Internal(format!("unknown entity kind {other:?}"))),
        }
    }
}

// =============================================================================
// Base fields
// =============================================================================

/// Fields every entity carries.
///
/// Domain types embed this with `#[serde(flatten)]`, so the base fields sit
/// next to the kind-specific ones in the stored document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityMeta {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub revision: u64,
    pub status: Status,
    pub reason: Vec<String>,
    pub tags: Tags,
    pub delete: bool,
}

impl EntityMeta {
    /// Fresh metadata for an entity about to be added.
    pub fn new(organization_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            organization_id: organization_id.into(),
            status: Status::Initialized,
            ..Default::default()
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Record a failure. Consecutive identical messages are kept once.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.status = Status::Error;
        if self.reason.last() != Some(&message) {
            self.reason.push(message);
        }
    }

    /// Adopt an observed status; the reason survives only on ERROR.
    pub fn set_observed_status(&mut self, status: Status, reason: Vec<String>) {
        self.status = status;
        if status == Status::Error {
            if !reason.is_empty() {
                self.reason = reason;
            }
        } else {
            self.reason.clear();
        }
    }

    pub fn mark_deleting(&mut self) {
        self.delete = true;
        self.status = Status::Deleting;
    }
}

// =============================================================================
// Entity trait
// =============================================================================

/// A persistable, kind-tagged document.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn meta(&self) -> &EntityMeta;
    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn key(&self) -> EntityKey {
        let meta = self.meta();
        EntityKey::new(&meta.organization_id, Self::KIND, &meta.name)
    }
}

/// Uniqueness key of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub organization_id: String,
    pub kind: EntityKind,
    pub name: String,
}

impl EntityKey {
    pub fn new(organization_id: &str, kind: EntityKind, name: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            kind,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.organization_id, self.name)
    }
}
