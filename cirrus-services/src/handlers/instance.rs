//! Service instance handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cirrus_controller::EntityHandler;
use cirrus_store::{
    EntityMeta, EntityStore, Filter, FilterStat, FilterVerb, Options, Status,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{OrphanPolicy, apply_observed, retry_due};
use crate::broker::{BrokerClient, BrokerInstance};
use crate::entities::{ServiceBinding, ServiceClass, ServiceInstance};

pub struct ServiceInstanceHandler {
    store: EntityStore,
    broker: Arc<dyn BrokerClient>,
    orphans: OrphanPolicy,
}

impl ServiceInstanceHandler {
    pub fn new(store: EntityStore, broker: Arc<dyn BrokerClient>, orphans: OrphanPolicy) -> Self {
        Self {
            store,
            broker,
            orphans,
        }
    }

    /// Resolve class and plan, then ask the broker to provision.
    async fn provision(&self, instance: &mut ServiceInstance) -> Result<()> {
        let org = &instance.meta.organization_id;
        let class: ServiceClass = self
            .store
            .find(org, &instance.service_class, &Options::default())
            .await?
            .ok_or_else(|| anyhow!("service class {} not found", instance.service_class))?;
        if class.plan(&instance.service_plan).is_none() {
            return Err(anyhow!(
                "service plan {} not found for service class {}",
                instance.service_plan,
                instance.service_class
            ));
        }

        let observed = self.broker.create_service(&class, instance).await?;
        instance.instance_id = observed.instance_id;
        let status = match observed.status {
            Status::Unknown => Status::Creating,
            status => status,
        };
        instance.meta.set_observed_status(status, observed.reason);
        Ok(())
    }

    async fn persist(&self, mut instance: ServiceInstance) -> Result<()> {
        let revision = instance.meta.revision;
        self.store.update(revision, &mut instance).await?;
        Ok(())
    }

    async fn has_bindings(&self, instance: &ServiceInstance) -> Result<bool> {
        let owned = Filter::everything().add(FilterStat::extra(
            "serviceInstanceID",
            FilterVerb::Equal,
            instance.meta.id.as_str(),
        ));
        let bindings: Vec<ServiceBinding> = self
            .store
            .list(&instance.meta.organization_id, &Options::filtered(owned))
            .await?;
        Ok(!bindings.is_empty())
    }

    async fn adopt(&self, organization_id: &str, orphan: &BrokerInstance) {
        match self.orphans {
            OrphanPolicy::Ignore => {
                warn!(
                    organization = organization_id,
                    instance_id = %orphan.instance_id,
                    name = %orphan.name,
                    "Broker reports an unmanaged service instance"
                );
            }
            OrphanPolicy::Import => {
                let mut instance = ServiceInstance {
                    meta: EntityMeta {
                        status: orphan.status,
                        reason: orphan.reason.clone(),
                        ..EntityMeta::new(organization_id, &orphan.name)
                    },
                    service_class: orphan.service_class.clone(),
                    service_plan: orphan.service_plan.clone(),
                    namespace: String::new(),
                    parameters: Value::Null,
                    secret_parameters: Vec::new(),
                    instance_id: orphan.instance_id.clone(),
                    bind: false,
                };
                match self.store.add(&mut instance).await {
                    Ok(_) => info!(
                        organization = organization_id,
                        instance = %orphan.name,
                        "Imported unmanaged service instance"
                    ),
                    Err(e) => warn!(
                        organization = organization_id,
                        instance = %orphan.name,
                        error = %e,
                        "Failed to import unmanaged service instance"
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl EntityHandler for ServiceInstanceHandler {
    type Entity = ServiceInstance;

    async fn add(&self, mut instance: ServiceInstance) -> Result<()> {
        let outcome = self.provision(&mut instance).await;
        self.store.update_with_error(&mut instance, &outcome).await;
        if outcome.is_ok() {
            info!(
                organization = %instance.meta.organization_id,
                instance = %instance.meta.name,
                status = %instance.meta.status,
                "Provisioned service instance"
            );
        }
        outcome
    }

    async fn update(&self, instance: ServiceInstance) -> Result<()> {
        self.persist(instance).await
    }

    async fn delete(&self, mut instance: ServiceInstance) -> Result<()> {
        if self.has_bindings(&instance).await? {
            debug!(instance = %instance.meta.name, "Waiting for bindings before deleting service instance");
            return Ok(());
        }

        if instance.is_provisioned() {
            let outcome = self.broker.delete_service(&instance).await;
            if outcome.is_err() {
                // The delete flag survives, so the next resync retries.
                self.store.update_with_error(&mut instance, &outcome).await;
                return outcome;
            }
        }

        self.store
            .delete::<ServiceInstance>(&instance.meta.organization_id, &instance.meta.name)
            .await?;
        info!(
            organization = %instance.meta.organization_id,
            instance = %instance.meta.name,
            "Deleted service instance"
        );
        Ok(())
    }

    async fn error(&self, instance: ServiceInstance) -> Result<()> {
        self.persist(instance).await
    }

    async fn sync(&self, organization_id: &str, resync_period: Duration) -> Result<Vec<ServiceInstance>> {
        let mut actual: HashMap<String, BrokerInstance> = self
            .broker
            .list_service_instances()
            .await?
            .into_iter()
            .filter(|i| i.organization_id == organization_id)
            .map(|i| (i.instance_id.clone(), i))
            .collect();
        let stored: Vec<ServiceInstance> = self.store.list(organization_id, &Options::default()).await?;

        let mut synced = Vec::new();
        for mut instance in stored {
            let observed = actual.remove(&instance.instance_id);

            if instance.meta.status == Status::Initialized || instance.meta.delete {
                synced.push(instance);
                continue;
            }

            if !instance.is_provisioned() {
                // Provisioning never got through; retry it, paced by the resync period.
                if instance.meta.status == Status::Error && retry_due(&instance.meta, resync_period) {
                    instance.meta.status = Status::Initialized;
                    synced.push(instance);
                }
                continue;
            }

            match observed {
                None => {
                    debug!(instance = %instance.meta.name, "Service instance vanished from broker");
                    instance.meta.mark_deleting();
                    synced.push(instance);
                }
                Some(observed) => {
                    if apply_observed(&mut instance.meta, observed.status, &observed.reason) {
                        debug!(instance = %instance.meta.name, status = %instance.meta.status, "Service instance status changed");
                        synced.push(instance);
                    }
                }
            }
        }

        for orphan in actual.values() {
            self.adopt(organization_id, orphan).await;
        }
        Ok(synced)
    }
}
