//! Transport-independent service manager API.
//!
//! Every accepted write is stored first and then handed to the controller
//! through the matching [`Watcher`], exactly once.

use cirrus_controller::Watcher;
use cirrus_store::{
    EntityMeta, EntityStore, Filter, FilterStat, FilterVerb, Options, StoreError, Tags,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::entities::{ServiceBinding, ServiceClass, ServiceInstance};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(StoreError),
}

impl ApiError {
    /// HTTP status a REST transport should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::BadRequest(_) => 400,
            ApiError::Store(_) => 500,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => ApiError::NotFound(key),
            e if e.is_conflict() => ApiError::Conflict(e.to_string()),
            StoreError::InvalidName(_)
            | StoreError::InvalidArgument(_)
            | StoreError::InvalidFilter(_) => ApiError::BadRequest(e.to_string()),
            e => ApiError::Store(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

// =============================================================================
// Request DTOs
// =============================================================================

/// Request to create a service instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateServiceInstanceRequest {
    pub name: String,
    pub service_class: String,
    pub service_plan: String,
    pub namespace: String,
    pub parameters: Value,
    pub secret_parameters: Vec<String>,
    /// Also create a binding named after the instance if the plan is bindable.
    pub bind: bool,
    pub tags: Tags,
}

/// Request to bind to an existing service instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateServiceBindingRequest {
    pub name: String,
    pub service_instance: String,
    pub parameters: Value,
    pub secret_parameters: Vec<String>,
    pub tags: Tags,
}

/// Service manager API over the store and the controller's watchers.
#[derive(Clone)]
pub struct ServiceManager {
    store: EntityStore,
    instances: Watcher<ServiceInstance>,
    bindings: Watcher<ServiceBinding>,
}

impl ServiceManager {
    pub fn new(
        store: EntityStore,
        instances: Watcher<ServiceInstance>,
        bindings: Watcher<ServiceBinding>,
    ) -> Self {
        Self {
            store,
            instances,
            bindings,
        }
    }

    // =========================================================================
    // Service classes
    // =========================================================================

    pub async fn get_service_class(&self, organization_id: &str, name: &str) -> Result<ServiceClass> {
        Ok(self.store.get(organization_id, name, &Options::default()).await?)
    }

    pub async fn list_service_classes(&self, organization_id: &str, filter: Filter) -> Result<Vec<ServiceClass>> {
        Ok(self.store.list(organization_id, &Options::filtered(filter)).await?)
    }

    // =========================================================================
    // Service instances
    // =========================================================================

    /// Store a new instance as `INITIALIZED` and schedule provisioning.
    ///
    /// Returns the instance and, if one was requested and allowed, its binding.
    pub async fn create_service_instance(
        &self,
        organization_id: &str,
        req: CreateServiceInstanceRequest,
    ) -> Result<(ServiceInstance, Option<ServiceBinding>)> {
        let class: ServiceClass = self
            .store
            .find(organization_id, &req.service_class, &Options::default())
            .await?
            .ok_or_else(|| {
                ApiError::BadRequest(format!("service class {} not found", req.service_class))
            })?;
        let plan = class.plan(&req.service_plan).ok_or_else(|| {
            ApiError::BadRequest(format!(
                "service plan {} not found for service class {}",
                req.service_plan, req.service_class
            ))
        })?;
        let bindable = req.bind && plan.bindable;

        let mut instance = ServiceInstance {
            meta: EntityMeta::new(organization_id, &req.name).with_tags(req.tags.clone()),
            service_class: req.service_class,
            service_plan: req.service_plan,
            namespace: req.namespace,
            parameters: req.parameters,
            secret_parameters: req.secret_parameters,
            instance_id: String::new(),
            bind: req.bind,
        };
        self.store.add(&mut instance).await?;
        self.instances.on_action(instance.clone()).await;
        info!(organization = organization_id, instance = %instance.meta.name, "Created service instance");

        if !bindable {
            return Ok((instance, None));
        }

        let mut binding = ServiceBinding::for_instance(&instance, &instance.meta.name);
        binding.meta.tags = req.tags;
        self.store.add(&mut binding).await?;
        self.bindings.on_action(binding.clone()).await;
        Ok((instance, Some(binding)))
    }

    pub async fn get_service_instance(&self, organization_id: &str, name: &str) -> Result<ServiceInstance> {
        Ok(self.store.get(organization_id, name, &Options::default()).await?)
    }

    pub async fn list_service_instances(
        &self,
        organization_id: &str,
        filter: Filter,
    ) -> Result<Vec<ServiceInstance>> {
        Ok(self.store.list(organization_id, &Options::filtered(filter)).await?)
    }

    /// Mark the instance and its bindings for deletion.
    ///
    /// The instance itself is torn down only after its bindings are gone.
    pub async fn delete_service_instance(&self, organization_id: &str, name: &str) -> Result<ServiceInstance> {
        let mut instance: ServiceInstance = self.store.get(organization_id, name, &Options::default()).await?;

        for mut binding in self.bindings_of(&instance).await? {
            if binding.meta.delete {
                continue;
            }
            self.store.soft_delete(&mut binding).await?;
            self.bindings.on_action(binding).await;
        }

        self.store.soft_delete(&mut instance).await?;
        self.instances.on_action(instance.clone()).await;
        info!(organization = organization_id, instance = name, "Deleting service instance");
        Ok(instance)
    }

    // =========================================================================
    // Service bindings
    // =========================================================================

    pub async fn create_service_binding(
        &self,
        organization_id: &str,
        req: CreateServiceBindingRequest,
    ) -> Result<ServiceBinding> {
        let instance: ServiceInstance = self
            .store
            .find(organization_id, &req.service_instance, &Options::filtered(Filter::exists()))
            .await?
            .ok_or_else(|| {
                ApiError::BadRequest(format!("service instance {} not found", req.service_instance))
            })?;

        let mut binding = ServiceBinding::for_instance(&instance, &req.name);
        binding.meta.tags = req.tags;
        binding.parameters = req.parameters;
        binding.secret_parameters = req.secret_parameters;
        self.store.add(&mut binding).await?;
        self.bindings.on_action(binding.clone()).await;
        Ok(binding)
    }

    pub async fn get_service_binding(&self, organization_id: &str, name: &str) -> Result<ServiceBinding> {
        Ok(self.store.get(organization_id, name, &Options::default()).await?)
    }

    pub async fn list_service_bindings(
        &self,
        organization_id: &str,
        filter: Filter,
    ) -> Result<Vec<ServiceBinding>> {
        Ok(self.store.list(organization_id, &Options::filtered(filter)).await?)
    }

    pub async fn delete_service_binding(&self, organization_id: &str, name: &str) -> Result<ServiceBinding> {
        let mut binding: ServiceBinding = self.store.get(organization_id, name, &Options::default()).await?;
        self.store.soft_delete(&mut binding).await?;
        self.bindings.on_action(binding.clone()).await;
        Ok(binding)
    }

    async fn bindings_of(&self, instance: &ServiceInstance) -> Result<Vec<ServiceBinding>> {
        let owned = Filter::everything().add(FilterStat::extra(
            "serviceInstanceID",
            FilterVerb::Equal,
            instance.meta.id.as_str(),
        ));
        Ok(self
            .store
            .list(&instance.meta.organization_id, &Options::filtered(owned))
            .await?)
    }
}
