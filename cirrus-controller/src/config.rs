use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Controller tuning. Built once at startup and passed to [`Controller::new`].
///
/// [`Controller::new`]: crate::Controller::new
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Organizations that get their own resync ticker.
    pub organization_ids: Vec<String>,
    pub resync_period: Duration,
    pub workers: usize,
    /// Capacity of the shared work queue; producers wait when it is full.
    pub queue_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            organization_ids: Vec::new(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl ControllerConfig {
    pub fn for_organizations<I, S>(organization_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            organization_ids: organization_ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.organization_ids.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "at least one organization is required".to_string(),
            ));
        }
        if self.organization_ids.iter().any(|org| org.is_empty()) {
            return Err(ControllerError::InvalidConfig(
                "organization IDs must not be empty".to_string(),
            ));
        }
        if self.resync_period.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "resync period must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(ControllerError::InvalidConfig(
                "queue depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
