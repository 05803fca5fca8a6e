use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use cirrus_store::{Entity, EntityStore, Filter, FilterStat, Options, Status};

/// Stored entities stuck in a transitional status for longer than one
/// resync period.
///
/// Handlers with no external inventory to diff against use this as their
/// `sync`. `filter` narrows the selection further.
pub async fn default_sync<E: Entity>(
    store: &EntityStore,
    organization_id: &str,
    resync_period: Duration,
    filter: Option<Filter>,
) -> Result<Vec<E>> {
    let cutoff = Utc::now() - chrono::Duration::from_std(resync_period)?;
    let filter = filter
        .unwrap_or_default()
        .add(FilterStat::modified_before(cutoff))
        .add(FilterStat::status_in(&[
            Status::Creating,
            Status::Updating,
            Status::Deleting,
        ]));
    Ok(store.list(organization_id, &Options::filtered(filter)).await?)
}
