use std::sync::Arc;

use cirrus_store::Entity;
use tokio::sync::mpsc;
use tracing::warn;

use crate::handler::EntityHandler;
use crate::job::Job;

/// Fast path from API writes into the controller.
///
/// Handed out by [`Controller::add_entity_handler`]. Entities pushed before
/// the controller starts wait in the queue; after shutdown they are dropped.
///
/// [`Controller::add_entity_handler`]: crate::Controller::add_entity_handler
pub struct Watcher<E: Entity> {
    handler: Arc<dyn EntityHandler<Entity = E>>,
    queue: mpsc::Sender<Job>,
}

impl<E: Entity> Clone for Watcher<E> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<E: Entity> std::fmt::Debug for Watcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").finish_non_exhaustive()
    }
}

impl<E: Entity> Watcher<E> {
    pub(crate) fn new(handler: Arc<dyn EntityHandler<Entity = E>>, queue: mpsc::Sender<Job>) -> Self {
        Self { handler, queue }
    }

    /// Schedule `entity` for processing. Waits while the queue is full.
    pub async fn on_action(&self, entity: E) {
        let job = Job::new(self.handler.clone(), entity);
        let key = job.key.clone();
        if self.queue.send(job).await.is_err() {
            warn!(%key, "Controller is stopped, dropping entity");
        }
    }
}
