//! Service class handler.
//!
//! Classes mirror the broker catalog; the service manager never provisions
//! them, it only keeps each organization's copy current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cirrus_controller::EntityHandler;
use cirrus_store::{EntityMeta, EntityStore, Options, Status};
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerServiceClass};
use crate::entities::ServiceClass;

pub struct ServiceClassHandler {
    store: EntityStore,
    broker: Arc<dyn BrokerClient>,
}

impl ServiceClassHandler {
    pub fn new(store: EntityStore, broker: Arc<dyn BrokerClient>) -> Self {
        Self { store, broker }
    }

    async fn persist(&self, mut class: ServiceClass) -> Result<()> {
        let revision = class.meta.revision;
        self.store.update(revision, &mut class).await?;
        Ok(())
    }

    async fn import(&self, organization_id: &str, offered: &BrokerServiceClass) {
        let mut class = ServiceClass {
            meta: EntityMeta {
                status: Status::Ready,
                ..EntityMeta::new(organization_id, &offered.name)
            },
            description: offered.description.clone(),
            service_id: offered.service_id.clone(),
            broker: offered.broker.clone(),
            bindable: offered.bindable,
            plans: offered.plans.clone(),
        };
        match self.store.add(&mut class).await {
            Ok(_) => info!(organization = organization_id, class = %offered.name, "Imported service class"),
            Err(e) => warn!(
                organization = organization_id,
                class = %offered.name,
                error = %e,
                "Failed to import service class"
            ),
        }
    }
}

/// Copy catalog fields that differ. Returns true if anything changed.
fn refresh(class: &mut ServiceClass, offered: &BrokerServiceClass) -> bool {
    let mut changed = false;
    if class.description != offered.description {
        class.description = offered.description.clone();
        changed = true;
    }
    if class.broker != offered.broker {
        class.broker = offered.broker.clone();
        changed = true;
    }
    if class.bindable != offered.bindable {
        class.bindable = offered.bindable;
        changed = true;
    }
    if class.plans != offered.plans {
        class.plans = offered.plans.clone();
        changed = true;
    }
    if class.meta.status != Status::Ready {
        class.meta.set_observed_status(Status::Ready, Vec::new());
        changed = true;
    }
    changed
}

#[async_trait]
impl EntityHandler for ServiceClassHandler {
    type Entity = ServiceClass;

    async fn add(&self, mut class: ServiceClass) -> Result<()> {
        class.meta.set_observed_status(Status::Ready, Vec::new());
        self.persist(class).await
    }

    async fn update(&self, class: ServiceClass) -> Result<()> {
        self.persist(class).await
    }

    async fn delete(&self, class: ServiceClass) -> Result<()> {
        self.store
            .delete::<ServiceClass>(&class.meta.organization_id, &class.meta.name)
            .await?;
        info!(organization = %class.meta.organization_id, class = %class.meta.name, "Removed service class");
        Ok(())
    }

    async fn error(&self, class: ServiceClass) -> Result<()> {
        self.persist(class).await
    }

    async fn sync(&self, organization_id: &str, _resync_period: Duration) -> Result<Vec<ServiceClass>> {
        let mut offered: HashMap<String, BrokerServiceClass> = self
            .broker
            .list_service_classes()
            .await?
            .into_iter()
            .map(|c| (c.service_id.clone(), c))
            .collect();
        let stored: Vec<ServiceClass> = self.store.list(organization_id, &Options::default()).await?;

        let mut synced = Vec::new();
        for mut class in stored {
            let actual = offered.remove(&class.service_id);
            if class.meta.status == Status::Initialized || class.meta.delete {
                synced.push(class);
                continue;
            }
            match actual {
                None => {
                    debug!(class = %class.meta.name, "Service class left the catalog");
                    class.meta.mark_deleting();
                    synced.push(class);
                }
                Some(actual) => {
                    if refresh(&mut class, &actual) {
                        synced.push(class);
                    }
                }
            }
        }

        for actual in offered.values() {
            self.import(organization_id, actual).await;
        }
        Ok(synced)
    }
}
