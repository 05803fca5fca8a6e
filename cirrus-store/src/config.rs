//! Backend selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const DEFAULT_ADDRESS: &str = "./cirrus.db";
pub const DEFAULT_BUCKET: &str = "cirrus";
pub const DEFAULT_USERNAME: &str = "cirrus";
pub const DEFAULT_PASSWORD: &str = "cirrus";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    #[default]
    Sqlite,
    Postgres,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgres",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "sqlite" => Ok(BackendKind::Sqlite),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown database backend {other:?}"
            ))),
        }
    }
}

/// Where and how entities are persisted.
///
/// `address` is a file path for SQLite and `host[:port]` for PostgreSQL.
/// `bucket` names the PostgreSQL database; the other backends ignore it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub backend: BackendKind,
    pub address: String,
    pub bucket: String,
    pub username: String,
    pub password: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            address: DEFAULT_ADDRESS.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

impl BackendConfig {
    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            ..Default::default()
        }
    }

    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            address: path.into(),
            ..Default::default()
        }
    }
}
