//! cirrus service manager.
//!
//! Keeps service classes, instances and bindings of each organization in
//! line with what the service broker reports, and exposes the API used to
//! request new instances and bindings.

pub mod api;
pub mod broker;
pub mod entities;
pub mod handlers;

use std::sync::Arc;

use cirrus_controller::{Controller, ControllerConfig, ControllerError};
use cirrus_store::EntityStore;

pub use api::{ApiError, CreateServiceBindingRequest, CreateServiceInstanceRequest, ServiceManager};
pub use broker::{
    BrokerBinding, BrokerClient, BrokerInstance, BrokerOp, BrokerServiceClass, MemoryBroker, Provisioning,
};
pub use entities::{ServiceBinding, ServiceClass, ServiceInstance, ServicePlan};
pub use handlers::{OrphanPolicy, ServiceBindingHandler, ServiceClassHandler, ServiceInstanceHandler};

/// Build a controller with the service manager's handlers registered.
///
/// The controller is returned unstarted.
pub fn new_controller(
    config: ControllerConfig,
    store: EntityStore,
    broker: Arc<dyn BrokerClient>,
    orphans: OrphanPolicy,
) -> Result<(Controller, ServiceManager), ControllerError> {
    let mut controller = Controller::new(config);

    controller.add_entity_handler(Arc::new(ServiceClassHandler::new(store.clone(), broker.clone())))?;
    let instances = controller.add_entity_handler(Arc::new(ServiceInstanceHandler::new(
        store.clone(),
        broker.clone(),
        orphans,
    )))?;
    let bindings = controller.add_entity_handler(Arc::new(ServiceBindingHandler::new(
        store.clone(),
        broker,
        orphans,
    )))?;

    Ok((controller, ServiceManager::new(store, instances, bindings)))
}
