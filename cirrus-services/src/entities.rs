//! Service manager entities.

use cirrus_store::{Entity, EntityKind, EntityMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A plan offered by a service class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicePlan {
    pub name: String,
    #[serde(rename = "id")]
    pub plan_id: String,
    pub description: String,
    pub free: bool,
    pub bindable: bool,
}

/// A service type offered by the broker's catalog. Mirrored, not owned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClass {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "serviceID")]
    pub service_id: String,
    #[serde(default)]
    pub broker: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plans: Vec<ServicePlan>,
}

impl ServiceClass {
    pub fn plan(&self, name: &str) -> Option<&ServicePlan> {
        self.plans.iter().find(|p| p.name == name)
    }
}

impl Entity for ServiceClass {
    const KIND: EntityKind = EntityKind::ServiceClass;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// A provisioned (or to-be-provisioned) service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub service_class: String,
    pub service_plan: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub parameters: Value,
    /// Names of secrets whose contents are merged into the parameters.
    #[serde(default)]
    pub secret_parameters: Vec<String>,
    /// Broker-side identifier; empty until provisioned.
    #[serde(rename = "instanceID", default)]
    pub instance_id: String,
    /// Create a binding alongside the instance when the plan allows it.
    #[serde(default)]
    pub bind: bool,
}

impl ServiceInstance {
    pub fn new(organization_id: &str, name: &str, service_class: &str, service_plan: &str) -> Self {
        Self {
            meta: EntityMeta::new(organization_id, name),
            service_class: service_class.to_string(),
            service_plan: service_plan.to_string(),
            namespace: String::new(),
            parameters: Value::Null,
            secret_parameters: Vec::new(),
            instance_id: String::new(),
            bind: false,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        !self.instance_id.is_empty()
    }
}

impl Entity for ServiceInstance {
    const KIND: EntityKind = EntityKind::ServiceInstance;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Credentials binding a consumer to a service instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBinding {
    #[serde(flatten)]
    pub meta: EntityMeta,
    /// Name of the owning instance at bind time, for display.
    pub service_instance: String,
    /// Stable ID of the owning instance entity.
    #[serde(rename = "serviceInstanceID")]
    pub service_instance_id: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub secret_parameters: Vec<String>,
    #[serde(rename = "bindingID", default)]
    pub binding_id: String,
    #[serde(default)]
    pub binding_secret: String,
}

impl ServiceBinding {
    /// A binding owned by `instance`, which must already be stored.
    pub fn for_instance(instance: &ServiceInstance, name: &str) -> Self {
        Self {
            meta: EntityMeta::new(&instance.meta.organization_id, name),
            service_instance: instance.meta.name.clone(),
            service_instance_id: instance.meta.id.clone(),
            parameters: Value::Null,
            secret_parameters: Vec::new(),
            binding_id: String::new(),
            binding_secret: String::new(),
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.binding_id.is_empty()
    }
}

impl Entity for ServiceBinding {
    const KIND: EntityKind = EntityKind::ServiceBinding;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
