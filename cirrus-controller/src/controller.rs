//! Controller: handler registry, worker pool and resync tickers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cirrus_store::{Entity, EntityKind};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::handler::EntityHandler;
use crate::job::Job;
use crate::locks::EntityLocks;
use crate::watcher::Watcher;

/// Type-erased view of a registered handler used by the resync loop.
#[async_trait]
trait Resync: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn jobs(&self, organization_id: &str, resync_period: Duration) -> Result<Vec<Job>>;
}

struct Registration<E: Entity> {
    handler: Arc<dyn EntityHandler<Entity = E>>,
}

#[async_trait]
impl<E: Entity> Resync for Registration<E> {
    fn kind(&self) -> EntityKind {
        self.handler.kind()
    }

    async fn jobs(&self, organization_id: &str, resync_period: Duration) -> Result<Vec<Job>> {
        let entities = self.handler.sync(organization_id, resync_period).await?;
        Ok(entities
            .into_iter()
            .map(|entity| Job::new(self.handler.clone(), entity))
            .collect())
    }
}

type Registry = Arc<Vec<Arc<dyn Resync>>>;

/// Reconciliation controller.
///
/// Register handlers, then [`start`](Self::start). Workers pull from one
/// shared queue fed by watchers and by one resync ticker per organization.
pub struct Controller {
    config: ControllerConfig,
    registrations: Vec<Arc<dyn Resync>>,
    watchers: HashMap<EntityKind, Box<dyn Any + Send + Sync>>,
    queue_tx: mpsc::Sender<Job>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    locks: Arc<EntityLocks>,
    shutdown_tx: watch::Sender<bool>,
    tickers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registrations: Vec::new(),
            watchers: HashMap::new(),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            locks: Arc::new(EntityLocks::default()),
            shutdown_tx,
            tickers: Vec::new(),
            workers: Vec::new(),
            started: false,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Register the handler for one entity kind and return its watcher.
    pub fn add_entity_handler<H: EntityHandler>(
        &mut self,
        handler: Arc<H>,
    ) -> Result<Watcher<H::Entity>, ControllerError> {
        if self.started {
            return Err(ControllerError::AlreadyStarted);
        }
        let kind = handler.kind();
        if self.watchers.contains_key(&kind) {
            return Err(ControllerError::DuplicateHandler(kind));
        }

        let handler: Arc<dyn EntityHandler<Entity = H::Entity>> = handler;
        self.registrations.push(Arc::new(Registration {
            handler: handler.clone(),
        }));
        let watcher = Watcher::new(handler, self.queue_tx.clone());
        self.watchers.insert(kind, Box::new(watcher.clone()));

        info!(%kind, "Registered entity handler");
        Ok(watcher)
    }

    /// Watcher for an already registered entity type.
    pub fn watcher<E: Entity>(&self) -> Option<Watcher<E>> {
        self.watchers
            .get(&E::KIND)
            .and_then(|w| w.downcast_ref::<Watcher<E>>())
            .cloned()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawn workers, run one synchronous resync pass for every organization,
    /// then start the periodic tickers.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        if self.started {
            return Err(ControllerError::AlreadyStarted);
        }
        self.config.validate()?;
        self.started = true;

        for id in 0..self.config.workers {
            self.workers.push(tokio::spawn(run_worker(
                id,
                self.queue_rx.clone(),
                self.locks.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        let registry: Registry = Arc::new(self.registrations.clone());
        let period = self.config.resync_period;

        for organization_id in &self.config.organization_ids {
            resync_organization(&registry, &self.queue_tx, organization_id, period).await;
        }

        for organization_id in &self.config.organization_ids {
            self.tickers.push(tokio::spawn(run_ticker(
                organization_id.clone(),
                period,
                registry.clone(),
                self.queue_tx.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        info!(
            workers = self.config.workers,
            organizations = self.config.organization_ids.len(),
            handlers = self.registrations.len(),
            resync_period = ?period,
            "Controller started"
        );
        Ok(())
    }

    /// Run one resync pass for every organization now. Returns the number of
    /// entities enqueued.
    pub async fn resync_now(&self) -> usize {
        let registry: Registry = Arc::new(self.registrations.clone());
        let mut enqueued = 0;
        for organization_id in &self.config.organization_ids {
            enqueued += resync_organization(
                &registry,
                &self.queue_tx,
                organization_id,
                self.config.resync_period,
            )
            .await;
        }
        enqueued
    }

    /// Stop tickers, drain queued work, and wait for in-flight handlers.
    pub async fn shutdown(&mut self) {
        info!("Controller shutting down");
        self.shutdown_tx.send_replace(true);

        for ticker in self.tickers.drain(..) {
            if let Err(e) = ticker.await {
                error!(error = %e, "Resync ticker task failed");
            }
        }
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }
        // Never-started controllers have no worker to close the queue.
        self.queue_rx.lock().await.close();

        info!("Controller stopped");
    }
}

/// Enqueue everything the registered handlers report for one organization.
async fn resync_organization(
    registry: &Registry,
    queue: &mpsc::Sender<Job>,
    organization_id: &str,
    resync_period: Duration,
) -> usize {
    let mut enqueued = 0;
    for registration in registry.iter() {
        let kind = registration.kind();
        let task = {
            let registration = registration.clone();
            let organization_id = organization_id.to_string();
            tokio::spawn(async move { registration.jobs(&organization_id, resync_period).await })
        };
        let jobs = match task.await {
            Ok(Ok(jobs)) => jobs,
            Ok(Err(e)) => {
                error!(organization = organization_id, %kind, error = %format!("{e:#}"), "Sync failed");
                continue;
            }
            Err(e) => {
                error!(organization = organization_id, %kind, error = %e, "Sync panicked");
                continue;
            }
        };

        for job in jobs {
            if queue.send(job).await.is_err() {
                warn!(organization = organization_id, "Work queue closed, abandoning resync");
                return enqueued;
            }
            enqueued += 1;
        }
    }
    debug!(organization = organization_id, enqueued, "Resync pass complete");
    enqueued
}

async fn run_ticker(
    organization_id: String,
    period: Duration,
    registry: Registry,
    queue: mpsc::Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                resync_organization(&registry, &queue, &organization_id, period).await;
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(organization = %organization_id, "Resync ticker stopped");
}

async fn run_worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    locks: Arc<EntityLocks>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "Worker started");
    loop {
        let next = {
            let mut rx = queue.lock().await;
            let stopping = *shutdown.borrow();
            if stopping {
                // Refuse new work, finish what is already queued.
                rx.close();
                rx.try_recv().ok()
            } else {
                tokio::select! {
                    biased;
                    job = rx.recv() => job,
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            rx.close();
                        }
                        continue;
                    }
                }
            }
        };

        let Some(job) = next else { break };
        process(id, job, &locks).await;
    }
    debug!(worker = id, "Worker stopped");
}

async fn process(worker: usize, job: Job, locks: &EntityLocks) {
    let Job { key, action, run } = job;
    let _guard = locks.lock(key.clone()).await;

    debug!(worker, %key, %action, "Processing entity");
    match tokio::spawn(run).await {
        Ok(Ok(())) => debug!(worker, %key, %action, "Entity processed"),
        Ok(Err(e)) => error!(worker, %key, %action, error = %format!("{e:#}"), "Entity handler failed"),
        Err(e) => error!(worker, %key, %action, error = %e, "Entity handler panicked"),
    }
}
