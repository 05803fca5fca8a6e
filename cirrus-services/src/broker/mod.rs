//! Service broker client contract.
//!
//! The broker is the external system that actually provisions services.
//! Handlers only see this trait; [`MemoryBroker`] implements it in process.

mod memory;

use anyhow::Result;
use async_trait::async_trait;
use cirrus_store::Status;
use serde::{Deserialize, Serialize};

use crate::entities::{ServiceBinding, ServiceClass, ServiceInstance, ServicePlan};

pub use memory::{BrokerOp, MemoryBroker, Provisioning};

/// A catalog entry as the broker advertises it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerServiceClass {
    pub name: String,
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

/// Observed state of a provisioned service.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerInstance {
    /// Broker-side identifier
    pub instance_id: String,
    pub organization_id: String,
    pub name: String,
    pub service_class: String,
    pub service_plan: String,
    pub status: Status,
    pub reason: Vec<String>,
}

/// Observed state of a binding.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerBinding {
    pub binding_id: String,
    pub organization_id: String,
    pub name: String,
    /// Broker-side identifier of the bound instance
    pub instance_id: String,
    pub binding_secret: String,
    pub status: Status,
    pub reason: Vec<String>,
}

/// Operations the service manager needs from a broker.
///
/// Create and delete calls must be idempotent: the controller may repeat
/// them when an earlier response was lost.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn list_service_classes(&self) -> Result<Vec<BrokerServiceClass>>;

    async fn list_service_instances(&self) -> Result<Vec<BrokerInstance>>;

    async fn list_service_bindings(&self) -> Result<Vec<BrokerBinding>>;

    /// Start provisioning. Returns the instance as observed right after the call.
    async fn create_service(
        &self,
        class: &ServiceClass,
        instance: &ServiceInstance,
    ) -> Result<BrokerInstance>;

    async fn delete_service(&self, instance: &ServiceInstance) -> Result<()>;

    async fn create_binding(
        &self,
        instance: &ServiceInstance,
        binding: &ServiceBinding,
    ) -> Result<BrokerBinding>;

    async fn delete_binding(&self, binding: &ServiceBinding) -> Result<()>;
}
