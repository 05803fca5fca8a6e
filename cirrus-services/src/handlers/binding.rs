//! Service binding handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cirrus_controller::EntityHandler;
use cirrus_store::{EntityMeta, EntityStore, Filter, FilterStat, FilterVerb, Options, Status};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{OrphanPolicy, apply_observed, retry_due};
use crate::broker::{BrokerBinding, BrokerClient};
use crate::entities::{ServiceBinding, ServiceInstance};

pub struct ServiceBindingHandler {
    store: EntityStore,
    broker: Arc<dyn BrokerClient>,
    orphans: OrphanPolicy,
}

impl ServiceBindingHandler {
    pub fn new(store: EntityStore, broker: Arc<dyn BrokerClient>, orphans: OrphanPolicy) -> Self {
        Self {
            store,
            broker,
            orphans,
        }
    }

    async fn find_instance(&self, organization_id: &str, stat: FilterStat) -> Result<Option<ServiceInstance>> {
        let instances: Vec<ServiceInstance> = self
            .store
            .list(organization_id, &Options::filtered(Filter::everything().add(stat)))
            .await?;
        Ok(instances.into_iter().next())
    }

    /// The instance this binding belongs to, looked up by its stable ID.
    async fn owner(&self, binding: &ServiceBinding) -> Result<Option<ServiceInstance>> {
        self.find_instance(
            &binding.meta.organization_id,
            FilterStat::field("id", FilterVerb::Equal, binding.service_instance_id.as_str()),
        )
        .await
    }

    async fn bind(&self, instance: &ServiceInstance, binding: &mut ServiceBinding) -> Result<()> {
        let observed = self.broker.create_binding(instance, binding).await?;
        binding.binding_id = observed.binding_id;
        binding.binding_secret = observed.binding_secret;
        let status = match observed.status {
            Status::Unknown => Status::Ready,
            status => status,
        };
        binding.meta.set_observed_status(status, observed.reason);
        Ok(())
    }

    async fn persist(&self, mut binding: ServiceBinding) -> Result<()> {
        let revision = binding.meta.revision;
        self.store.update(revision, &mut binding).await?;
        Ok(())
    }

    async fn adopt(&self, organization_id: &str, orphan: &BrokerBinding) {
        if self.orphans == OrphanPolicy::Ignore {
            warn!(
                organization = organization_id,
                binding_id = %orphan.binding_id,
                name = %orphan.name,
                "Broker reports an unmanaged service binding"
            );
            return;
        }

        let owner = self
            .find_instance(
                organization_id,
                FilterStat::extra("instanceID", FilterVerb::Equal, orphan.instance_id.as_str()),
            )
            .await;
        let owner = match owner {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                warn!(
                    organization = organization_id,
                    binding_id = %orphan.binding_id,
                    "Unmanaged service binding refers to an unknown instance, not importing"
                );
                return;
            }
            Err(e) => {
                warn!(
                    organization = organization_id,
                    binding_id = %orphan.binding_id,
                    error = %format!("{e:#}"),
                    "Failed to look up the owner of an unmanaged service binding"
                );
                return;
            }
        };

        let mut binding = ServiceBinding {
            meta: EntityMeta {
                status: orphan.status,
                reason: orphan.reason.clone(),
                ..EntityMeta::new(organization_id, &orphan.name)
            },
            service_instance: owner.meta.name.clone(),
            service_instance_id: owner.meta.id.clone(),
            parameters: Value::Null,
            secret_parameters: Vec::new(),
            binding_id: orphan.binding_id.clone(),
            binding_secret: orphan.binding_secret.clone(),
        };
        match self.store.add(&mut binding).await {
            Ok(_) => info!(organization = organization_id, binding = %orphan.name, "Imported unmanaged service binding"),
            Err(e) => warn!(
                organization = organization_id,
                binding = %orphan.name,
                error = %e,
                "Failed to import unmanaged service binding"
            ),
        }
    }
}

#[async_trait]
impl EntityHandler for ServiceBindingHandler {
    type Entity = ServiceBinding;

    async fn add(&self, mut binding: ServiceBinding) -> Result<()> {
        let owner = self.owner(&binding).await?;
        let outcome = match owner {
            None => Err(anyhow!(
                "service instance {} not found",
                binding.service_instance
            )),
            Some(instance) if instance.meta.status != Status::Ready => {
                debug!(
                    binding = %binding.meta.name,
                    instance = %instance.meta.name,
                    status = %instance.meta.status,
                    "Service instance not ready for binding"
                );
                return Ok(());
            }
            Some(instance) => self.bind(&instance, &mut binding).await,
        };
        self.store.update_with_error(&mut binding, &outcome).await;
        outcome
    }

    async fn update(&self, binding: ServiceBinding) -> Result<()> {
        self.persist(binding).await
    }

    async fn delete(&self, mut binding: ServiceBinding) -> Result<()> {
        if binding.is_bound() {
            let outcome = self.broker.delete_binding(&binding).await;
            if outcome.is_err() {
                self.store.update_with_error(&mut binding, &outcome).await;
                return outcome;
            }
        }

        self.store
            .delete::<ServiceBinding>(&binding.meta.organization_id, &binding.meta.name)
            .await?;
        info!(
            organization = %binding.meta.organization_id,
            binding = %binding.meta.name,
            "Deleted service binding"
        );
        Ok(())
    }

    async fn error(&self, binding: ServiceBinding) -> Result<()> {
        self.persist(binding).await
    }

    async fn sync(&self, organization_id: &str, resync_period: Duration) -> Result<Vec<ServiceBinding>> {
        let mut actual: HashMap<String, BrokerBinding> = self
            .broker
            .list_service_bindings()
            .await?
            .into_iter()
            .filter(|b| b.organization_id == organization_id)
            .map(|b| (b.binding_id.clone(), b))
            .collect();
        let instance_ids: HashSet<String> = self
            .store
            .list::<ServiceInstance>(organization_id, &Options::default())
            .await?
            .into_iter()
            .map(|i| i.meta.id)
            .collect();
        let stored: Vec<ServiceBinding> = self.store.list(organization_id, &Options::default()).await?;

        let mut synced = Vec::new();
        for mut binding in stored {
            let observed = actual.remove(&binding.binding_id);

            if binding.meta.delete {
                synced.push(binding);
                continue;
            }
            if !instance_ids.contains(&binding.service_instance_id) {
                debug!(binding = %binding.meta.name, "Service instance for binding is gone");
                binding.meta.mark_deleting();
                synced.push(binding);
                continue;
            }
            if binding.meta.status == Status::Initialized {
                synced.push(binding);
                continue;
            }
            if !binding.is_bound() {
                if binding.meta.status == Status::Error && retry_due(&binding.meta, resync_period) {
                    binding.meta.status = Status::Initialized;
                    synced.push(binding);
                }
                continue;
            }

            match observed {
                None => {
                    debug!(binding = %binding.meta.name, "Service binding vanished from broker");
                    binding.meta.mark_deleting();
                    synced.push(binding);
                }
                Some(observed) => {
                    if apply_observed(&mut binding.meta, observed.status, &observed.reason) {
                        synced.push(binding);
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
