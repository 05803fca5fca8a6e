use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use cirrus_store::Status;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{BrokerBinding, BrokerClient, BrokerInstance, BrokerServiceClass};
use crate::entities::{ServiceBinding, ServiceClass, ServiceInstance};

/// Broker operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    ListClasses,
    ListInstances,
    ListBindings,
    CreateService,
    DeleteService,
    CreateBinding,
    DeleteBinding,
}

/// How fast new instances become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provisioning {
    /// READY as soon as `create_service` returns
    Immediate,
    /// CREATING, then READY on the next inventory listing
    #[default]
    Deferred,
    /// CREATING until [`MemoryBroker::set_instance_status`] says otherwise
    Manual,
}

#[derive(Default)]
struct BrokerState {
    catalog: Vec<BrokerServiceClass>,
    /// Keyed by broker instance ID
    instances: BTreeMap<String, BrokerInstance>,
    /// Entity ID -> broker instance ID
    instance_owners: HashMap<String, String>,
    /// Keyed by broker binding ID
    bindings: BTreeMap<String, BrokerBinding>,
    /// Entity ID -> broker binding ID
    binding_owners: HashMap<String, String>,
    failures: HashMap<BrokerOp, String>,
    calls: HashMap<BrokerOp, usize>,
}

impl BrokerState {
    /// Count the call and consume a pending injected failure.
    fn begin(&mut self, op: BrokerOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.remove(&op) {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

/// In-process broker used for local runs and tests.
pub struct MemoryBroker {
    provisioning: Provisioning,
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new(catalog: Vec<BrokerServiceClass>) -> Self {
        Self {
            provisioning: Provisioning::default(),
            state: Mutex::new(BrokerState {
                catalog,
                ..Default::default()
            }),
        }
    }

    /// Load the catalog from a JSON array of service classes.
    pub fn from_catalog_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        let catalog: Vec<BrokerServiceClass> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse catalog {}", path.display()))?;
        Ok(Self::new(catalog))
    }

    pub fn with_provisioning(mut self, provisioning: Provisioning) -> Self {
        self.provisioning = provisioning;
        self
    }

    /// Make the next call of `op` fail with `message`.
    pub async fn fail_next(&self, op: BrokerOp, message: &str) {
        self.state.lock().await.failures.insert(op, message.to_string());
    }

    pub async fn calls(&self, op: BrokerOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn set_catalog(&self, catalog: Vec<BrokerServiceClass>) {
        self.state.lock().await.catalog = catalog;
    }

    pub async fn set_instance_status(&self, instance_id: &str, status: Status, reason: Vec<String>) {
        if let Some(instance) = self.state.lock().await.instances.get_mut(instance_id) {
            instance.status = status;
            instance.reason = reason;
        }
    }

    /// Add an instance the service manager did not create.
    pub async fn insert_instance(&self, instance: BrokerInstance) {
        self.state
            .lock()
            .await
            .instances
            .insert(instance.instance_id.clone(), instance);
    }

    /// Add or replace a binding as the broker reports it.
    pub async fn insert_binding(&self, binding: BrokerBinding) {
        self.state
            .lock()
            .await
            .bindings
            .insert(binding.binding_id.clone(), binding);
    }

    /// Drop an instance behind the service manager's back.
    pub async fn remove_instance(&self, instance_id: &str) {
        let mut state = self.state.lock().await;
        state.instances.remove(instance_id);
        state.instance_owners.retain(|_, id| id != instance_id);
    }

    pub async fn instances(&self) -> Vec<BrokerInstance> {
        self.state.lock().await.instances.values().cloned().collect()
    }

    pub async fn bindings(&self) -> Vec<BrokerBinding> {
        self.state.lock().await.bindings.values().cloned().collect()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn list_service_classes(&self) -> Result<Vec<BrokerServiceClass>> {
        let mut state = self.state.lock().await;
        state.begin(BrokerOp::ListClasses)?;
        Ok(state.catalog.clone())
    }

    async fn list_service_instances(&self) -> Result<Vec<BrokerInstance>> {
        let mut state = self.state.lock().await;
        state.begin(BrokerOp::ListInstances)?;
        let observed = state.instances.values().cloned().collect();
        if self.provisioning == Provisioning::Deferred {
            for instance in state.instances.values_mut() {
                if instance.status == Status::Creating {
                    instance.status = Status::Ready;
                }
            }
        }
        Ok(observed)
    }

    async fn list_service_bindings(&self) -> Result<Vec<BrokerBinding>> {
        let mut state = self.state.lock().await;
        state.begin(BrokerOp::ListBindings)?;
        Ok(state.bindings.values().cloned().collect())
    }

    async fn create_service(
        &self,
        class: &ServiceClass,
        instance: &ServiceInstance,
    ) -> Result<BrokerInstance> {
        let mut state = self.state.lock().await;
        state.begin(BrokerOp::CreateService)?;

        if let Some(existing) = state
            .instance_owners
            .get(&instance.meta.id)
            .and_then(|id| state.instances.get(id))
        {
            return Ok(existing.clone());
        }

        let offered = state
            .catalog
            .iter()
            .find(|c| c.service_id == class.service_id)
            .ok_or_else(|| anyhow!("service {} is not offered by this broker", class.service_id))?;
        if !offered.plans.iter().any(|p| p.name == instance.service_plan) {
            bail!(
                "plan {} is not offered for service {}",
                instance.service_plan,
                class.service_id
            );
        }

        let observed = BrokerInstance {
            instance_id: Uuid::new_v4().to_string(),
            organization_id: instance.meta.organization_id.clone(),
            name: instance.meta.name.clone(),
            service_class: instance.service_class.clone(),
            service_plan: instance.service_plan.clone(),
            status: match self.provisioning {
                Provisioning::Immediate => Status::Ready,
                Provisioning::Deferred | Provisioning::Manual => Status::Creating,
            },
            reason: Vec::new(),
        };
        debug!(instance = %instance.meta.name, instance_id = %observed.instance_id, "Provisioning service");
        state
            .instance_owners
            .insert(instance.meta.id.clone(), observed.instance_id.clone());
        state
            .instances
            .insert(observed.instance_id.clone(), observed.clone());
        Ok(observed)
    }

    async fn delete_service(&self, instance: &ServiceInstance) -> Result<()> {
        let mut state = self.state.lock().await;
        state.begin(BrokerOp::DeleteService)?;

        if state
            .bindings
            .values()
            .any(|b| b.instance_id == instance.instance_id)
        {
            bail!("service instance {} has active bindings", instance.meta.name);
        }
        state.instances.remove(&instance.instance_id);
        state.instance_owners.remove(&instance.meta.id);
        debug!(instance = %instance.meta.name, "Deprovisioned service");
        Ok(())
    }

    async fn create_binding(
        &self,
        instance: &ServiceInstance,
        binding: &ServiceBinding,
    ) -> Result<BrokerBinding> {
        let mut state = self.state.lock().await;
        state.begin(BrokerOp::CreateBinding)?;

        if let Some(existing) = state
            .binding_owners
            .get(&binding.meta.id)
            .and_then(|id| state.bindings.get(id))
        {
            return Ok(existing.clone());
        }

        match state.instances.get(&instance.instance_id) {
            Some(i) if i.status == Status::Ready => {}
            Some(i) => bail!("service instance {} is {}", instance.meta.name, i.status),
            None => bail!("service instance {} does not exist", instance.meta.name),
        }

        let observed = BrokerBinding {
            binding_id: Uuid::new_v4().to_string(),
            organization_id: binding.meta.organization_id.clone(),
            name: binding.meta.name.clone(),
            instance_id: instance.instance_id.clone(),
            binding_secret: Uuid::new_v4().simple().to_string(),
            status: Status::Ready,
            reason: Vec::new(),
        };
        state
            .binding_owners
            .insert(binding.meta.id.clone(), observed.binding_id.clone());
        state
            .bindings
            .insert(observed.binding_id.clone(), observed.clone());
        Ok(observed)
    }

    async fn delete_binding(&self, binding: &ServiceBinding) -> Result<()> {
        let mut state = self.state.lock().await;
        state.begin(BrokerOp::DeleteBinding)?;
        state.bindings.remove(&binding.binding_id);
        state.binding_owners.remove(&binding.meta.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ServicePlan;
    use std::io::Write;

    fn catalog() -> Vec<BrokerServiceClass> {
        vec![BrokerServiceClass {
            name: "mysql".to_string(),
            description: "MySQL".to_string(),
            service_id: "svc-mysql".to_string(),
            broker: "memory".to_string(),
            bindable: true,
            plans: vec![ServicePlan {
                name: "free".to_string(),
                plan_id: "plan-free".to_string(),
                bindable: true,
                free: true,
                ..Default::default()
            }],
        }]
    }

    fn class() -> ServiceClass {
        ServiceClass {
            meta: cirrus_store::EntityMeta::new("acme", "mysql"),
            description: String::new(),
            service_id: "svc-mysql".to_string(),
            broker: "memory".to_string(),
            bindable: true,
            plans: catalog()[0].plans.clone(),
        }
    }

    fn instance(name: &str) -> ServiceInstance {
        let mut si = ServiceInstance::new("acme", name, "mysql", "free");
        si.meta.id = format!("entity-{name}");
        si
    }

    #[tokio::test]
    async fn test_deferred_provisioning() {
        let broker = MemoryBroker::new(catalog());
        let created = broker.create_service(&class(), &instance("db1")).await.unwrap();
        assert_eq!(created.status, Status::Creating);

        // The listing that observes CREATING flips it for the next one.
        let first = broker.list_service_instances().await.unwrap();
        assert_eq!(first[0].status, Status::Creating);
        let second = broker.list_service_instances().await.unwrap();
        assert_eq!(second[0].status, Status::Ready);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let broker = MemoryBroker::new(catalog()).with_provisioning(Provisioning::Immediate);
        let a = broker.create_service(&class(), &instance("db1")).await.unwrap();
        let b = broker.create_service(&class(), &instance("db1")).await.unwrap();
        assert_eq!(a.instance_id, b.instance_id);
        assert_eq!(broker.instances().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_plan_rejected() {
        let broker = MemoryBroker::new(catalog());
        let mut si = instance("db1");
        si.service_plan = "gold".to_string();
        let err = broker.create_service(&class(), &si).await.unwrap_err();
        assert!(err.to_string().contains("gold"));
    }

    #[tokio::test]
    async fn test_delete_blocked_by_binding() {
        let broker = MemoryBroker::new(catalog()).with_provisioning(Provisioning::Immediate);
        let mut si = instance("db1");
        si.instance_id = broker.create_service(&class(), &si).await.unwrap().instance_id;

        let mut binding = ServiceBinding::for_instance(&si, "db1");
        binding.meta.id = "binding-1".to_string();
        binding.binding_id = broker.create_binding(&si, &binding).await.unwrap().binding_id;

        assert!(broker.delete_service(&si).await.is_err());
        broker.delete_binding(&binding).await.unwrap();
        broker.delete_service(&si).await.unwrap();
        assert!(broker.instances().await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let broker = MemoryBroker::new(catalog());
        broker.fail_next(BrokerOp::ListClasses, "catalog offline").await;

        let err = broker.list_service_classes().await.unwrap_err();
        assert_eq!(err.to_string(), "catalog offline");
        assert!(broker.list_service_classes().await.is_ok());
        assert_eq!(broker.calls(BrokerOp::ListClasses).await, 2);
    }

    #[tokio::test]
    async fn test_catalog_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "redis", "serviceID": "svc-redis", "plans": [{{"name": "small", "id": "p-small"}}]}}]"#
        )
        .unwrap();

        let broker = MemoryBroker::from_catalog_file(file.path()).unwrap();
        let classes = broker.list_service_classes().await.unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].plans[0].plan_id, "p-small");
    }
}
