//! Entity handlers for the service manager.

mod binding;
mod class;
mod instance;

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cirrus_store::{EntityMeta, Status};
use serde::{Deserialize, Serialize};

pub use binding::ServiceBindingHandler;
pub use class::ServiceClassHandler;
pub use instance::ServiceInstanceHandler;

/// What to do with broker objects no stored entity accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Log them and leave them alone.
    #[default]
    Ignore,
    /// Bring them under management as new entities.
    Import,
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(OrphanPolicy::Ignore),
            "import" => Ok(OrphanPolicy::Import),
            other => Err(format!("unknown orphan policy {other:?}")),
        }
    }
}

/// Adopt an observed status if it differs from the stored one.
/// Returns true when `meta` changed and the entity needs processing.
fn apply_observed(meta: &mut EntityMeta, observed: Status, reason: &[String]) -> bool {
    if observed == Status::Unknown || observed == meta.status {
        return false;
    }
    meta.set_observed_status(observed, reason.to_vec());
    true
}

/// A failed first attempt is retried once it is older than a resync period.
fn retry_due(meta: &EntityMeta, resync_period: Duration) -> bool {
    let Ok(period) = chrono::Duration::from_std(resync_period) else {
        return false;
    };
    meta.modified_time
        .is_none_or(|modified| modified <= Utc::now() - period)
}
