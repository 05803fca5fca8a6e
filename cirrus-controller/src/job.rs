use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cirrus_store::{Entity, EntityKey};

use crate::handler::{Action, EntityHandler, dispatch};

/// One unit of queued work: an entity bound to its handler and the
/// callback its state selected at enqueue time.
pub(crate) struct Job {
    pub(crate) key: EntityKey,
    pub(crate) action: Action,
    pub(crate) run: Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>,
}

impl Job {
    pub(crate) fn new<E: Entity>(handler: Arc<dyn EntityHandler<Entity = E>>, entity: E) -> Self {
        let key = entity.key();
        let action = Action::for_entity(entity.meta());
        let run = Box::pin(async move { dispatch(handler.as_ref(), action, entity).await });
        Self { key, action, run }
    }
}
