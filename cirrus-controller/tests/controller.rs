//! Controller integration tests against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use cirrus_controller::{
    Action, Controller, ControllerConfig, ControllerError, EntityHandler, default_sync,
};
use cirrus_store::{
    Entity, EntityKind, EntityMeta, EntityStore, Filter, FilterStat, Options, Status,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

// =============================================================================
// Test entities and handler
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Widget {
    #[serde(flatten)]
    meta: EntityMeta,
    color: String,
}

impl Entity for Widget {
    const KIND: EntityKind = EntityKind::Function;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Gadget {
    #[serde(flatten)]
    meta: EntityMeta,
}

impl Entity for Gadget {
    const KIND: EntityKind = EntityKind::Image;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

fn make_widget(name: &str, status: Status) -> Widget {
    Widget {
        meta: EntityMeta {
            status,
            ..EntityMeta::new("acme", name)
        },
        color: "blue".to_string(),
    }
}

type Events = mpsc::UnboundedReceiver<(Action, String)>;

struct RecordingHandler {
    store: EntityStore,
    events: mpsc::UnboundedSender<(Action, String)>,
    delay: Duration,
    fail_sync: bool,
    sync_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    finished: AtomicBool,
}

impl RecordingHandler {
    fn new(store: EntityStore) -> (Self, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self {
            store,
            events: tx,
            delay: Duration::ZERO,
            fail_sync: false,
            sync_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        };
        (handler, rx)
    }

    async fn record(&self, action: Action, name: &str) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match name {
            "bad" => Err(anyhow!("bad widget")),
            "boom" => panic!("handler blew up"),
            _ => {
                self.finished.store(true, Ordering::SeqCst);
                let _ = self.events.send((action, name.to_string()));
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EntityHandler for RecordingHandler {
    type Entity = Widget;

    async fn add(&self, entity: Widget) -> Result<()> {
        self.record(Action::Add, &entity.meta.name).await
    }

    async fn update(&self, entity: Widget) -> Result<()> {
        self.record(Action::Update, &entity.meta.name).await
    }

    async fn delete(&self, entity: Widget) -> Result<()> {
        self.record(Action::Delete, &entity.meta.name).await
    }

    async fn error(&self, entity: Widget) -> Result<()> {
        self.record(Action::Error, &entity.meta.name).await
    }

    async fn sync(&self, organization_id: &str, _resync_period: Duration) -> Result<Vec<Widget>> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sync {
            return Err(anyhow!("inventory unavailable"));
        }
        let creating = Filter::everything().add(FilterStat::status_in(&[Status::Creating]));
        Ok(self
            .store
            .list(organization_id, &Options::filtered(creating))
            .await?)
    }
}

struct GadgetHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EntityHandler for GadgetHandler {
    type Entity = Gadget;

    async fn add(&self, entity: Gadget) -> Result<()> {
        self.seen.lock().await.push(entity.meta.name);
        Ok(())
    }

    async fn update(&self, entity: Gadget) -> Result<()> {
        self.seen.lock().await.push(entity.meta.name);
        Ok(())
    }

    async fn delete(&self, _entity: Gadget) -> Result<()> {
        Ok(())
    }

    async fn error(&self, _entity: Gadget) -> Result<()> {
        Ok(())
    }

    async fn sync(&self, organization_id: &str, _resync_period: Duration) -> Result<Vec<Gadget>> {
        Ok(vec![Gadget {
            meta: EntityMeta {
                status: Status::Creating,
                ..EntityMeta::new(organization_id, "g1")
            },
        }])
    }
}

fn config(workers: usize, resync_period: Duration) -> ControllerConfig {
    ControllerConfig {
        workers,
        resync_period,
        ..ControllerConfig::for_organizations(["acme"])
    }
}

async fn next_event(events: &mut Events) -> (Action, String) {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("event channel closed")
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let store = EntityStore::in_memory();
    let mut controller = Controller::new(config(1, Duration::from_secs(60)));

    let (first, _rx1) = RecordingHandler::new(store.clone());
    let (second, _rx2) = RecordingHandler::new(store);
    controller.add_entity_handler(Arc::new(first)).unwrap();

    let err = controller.add_entity_handler(Arc::new(second)).unwrap_err();
    assert!(matches!(err, ControllerError::DuplicateHandler(EntityKind::Function)));

    assert!(controller.watcher::<Widget>().is_some());
    assert!(controller.watcher::<Gadget>().is_none());
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let mut controller = Controller::new(ControllerConfig::default());
    assert!(matches!(
        controller.start().await,
        Err(ControllerError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_register_after_start_rejected() {
    let store = EntityStore::in_memory();
    let mut controller = Controller::new(config(1, Duration::from_secs(60)));
    controller.start().await.unwrap();

    let (handler, _rx) = RecordingHandler::new(store);
    assert!(matches!(
        controller.add_entity_handler(Arc::new(handler)),
        Err(ControllerError::AlreadyStarted)
    ));
    controller.shutdown().await;
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_watcher_routes_by_state() {
    let store = EntityStore::in_memory();
    let (handler, mut events) = RecordingHandler::new(store);
    let mut controller = Controller::new(config(2, Duration::from_secs(60)));
    let watcher = controller.add_entity_handler(Arc::new(handler)).unwrap();
    controller.start().await.unwrap();

    watcher.on_action(make_widget("w1", Status::Initialized)).await;
    assert_eq!(next_event(&mut events).await, (Action::Add, "w1".to_string()));

    watcher.on_action(make_widget("w2", Status::Error)).await;
    assert_eq!(next_event(&mut events).await, (Action::Error, "w2".to_string()));

    watcher.on_action(make_widget("w3", Status::Ready)).await;
    assert_eq!(next_event(&mut events).await, (Action::Update, "w3".to_string()));

    let mut doomed = make_widget("w4", Status::Ready);
    doomed.meta.mark_deleting();
    watcher.on_action(doomed).await;
    assert_eq!(next_event(&mut events).await, (Action::Delete, "w4".to_string()));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_failures_are_isolated() {
    let store = EntityStore::in_memory();
    let (handler, mut events) = RecordingHandler::new(store);
    let mut controller = Controller::new(config(1, Duration::from_secs(60)));
    let watcher = controller.add_entity_handler(Arc::new(handler)).unwrap();
    controller.start().await.unwrap();

    watcher.on_action(make_widget("bad", Status::Initialized)).await;
    watcher.on_action(make_widget("boom", Status::Initialized)).await;
    watcher.on_action(make_widget("good", Status::Initialized)).await;

    // The single worker survives both the error and the panic.
    assert_eq!(next_event(&mut events).await, (Action::Add, "good".to_string()));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_same_entity_never_processed_concurrently() {
    let store = EntityStore::in_memory();
    let (mut handler, mut events) = RecordingHandler::new(store);
    handler.delay = Duration::from_millis(20);
    let handler = Arc::new(handler);

    let mut controller = Controller::new(config(4, Duration::from_secs(60)));
    let watcher = controller.add_entity_handler(handler.clone()).unwrap();
    controller.start().await.unwrap();

    for _ in 0..5 {
        watcher.on_action(make_widget("same", Status::Ready)).await;
    }
    for _ in 0..5 {
        next_event(&mut events).await;
    }

    assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_distinct_entities_run_in_parallel() {
    let store = EntityStore::in_memory();
    let (mut handler, mut events) = RecordingHandler::new(store);
    handler.delay = Duration::from_millis(100);
    let handler = Arc::new(handler);

    let mut controller = Controller::new(config(4, Duration::from_secs(60)));
    let watcher = controller.add_entity_handler(handler.clone()).unwrap();
    controller.start().await.unwrap();

    for name in ["a", "b", "c", "d"] {
        watcher.on_action(make_widget(name, Status::Ready)).await;
    }
    for _ in 0..4 {
        next_event(&mut events).await;
    }

    assert!(handler.max_in_flight.load(Ordering::SeqCst) > 1);
    controller.shutdown().await;
}

// =============================================================================
// Resync
// =============================================================================

#[tokio::test]
async fn test_initial_sync_runs_on_start() {
    let store = EntityStore::in_memory();
    let mut pending = make_widget("pending", Status::Initialized);
    store.add(&mut pending).await.unwrap();
    pending.meta.status = Status::Creating;
    store.update(pending.meta.revision, &mut pending).await.unwrap();

    let (handler, mut events) = RecordingHandler::new(store);
    let mut controller = Controller::new(config(1, Duration::from_secs(60)));
    controller.add_entity_handler(Arc::new(handler)).unwrap();
    controller.start().await.unwrap();

    assert_eq!(next_event(&mut events).await, (Action::Update, "pending".to_string()));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_periodic_resync() {
    let store = EntityStore::in_memory();
    let (handler, _events) = RecordingHandler::new(store);
    let handler = Arc::new(handler);

    let mut controller = Controller::new(config(1, Duration::from_millis(30)));
    controller.add_entity_handler(handler.clone()).unwrap();
    controller.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.shutdown().await;

    // Initial pass plus several ticks.
    assert!(handler.sync_calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_sync_failure_does_not_block_other_kinds() {
    let store = EntityStore::in_memory();
    let (mut failing, _events) = RecordingHandler::new(store);
    failing.fail_sync = true;
    let gadgets = Arc::new(GadgetHandler {
        seen: Mutex::new(Vec::new()),
    });

    let mut controller = Controller::new(config(1, Duration::from_secs(60)));
    controller.add_entity_handler(Arc::new(failing)).unwrap();
    controller.add_entity_handler(gadgets.clone()).unwrap();
    controller.start().await.unwrap();

    assert!(controller.resync_now().await >= 1);
    controller.shutdown().await;

    assert!(gadgets.seen.lock().await.contains(&"g1".to_string()));
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_work() {
    let store = EntityStore::in_memory();
    let (mut handler, _events) = RecordingHandler::new(store);
    handler.delay = Duration::from_millis(100);
    let handler = Arc::new(handler);

    let mut controller = Controller::new(config(1, Duration::from_secs(60)));
    let watcher = controller.add_entity_handler(handler.clone()).unwrap();
    controller.start().await.unwrap();

    watcher.on_action(make_widget("slow", Status::Initialized)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.shutdown().await;

    assert!(handler.finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_on_action_after_shutdown_is_dropped() {
    let store = EntityStore::in_memory();
    let (handler, mut events) = RecordingHandler::new(store);
    let mut controller = Controller::new(config(1, Duration::from_secs(60)));
    let watcher = controller.add_entity_handler(Arc::new(handler)).unwrap();
    controller.start().await.unwrap();
    controller.shutdown().await;

    watcher.on_action(make_widget("late", Status::Initialized)).await;
    assert!(
        timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err()
    );
}

// =============================================================================
// default_sync
// =============================================================================

#[tokio::test]
async fn test_default_sync_selects_stale_transitional() {
    let store = EntityStore::in_memory();
    for (name, status) in [
        ("ready", Status::Ready),
        ("creating", Status::Creating),
        ("deleting", Status::Deleting),
        ("fresh", Status::Initialized),
    ] {
        let mut w = make_widget(name, Status::Initialized);
        store.add(&mut w).await.unwrap();
        w.meta.status = status;
        store.update(w.meta.revision, &mut w).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut stale: Vec<String> = default_sync::<Widget>(&store, "acme", Duration::ZERO, None)
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.meta.name)
        .collect();
    stale.sort();
    assert_eq!(stale, vec!["creating", "deleting"]);

    let recent = default_sync::<Widget>(&store, "acme", Duration::from_secs(3600), None)
        .await
        .unwrap();
    assert!(recent.is_empty());

    let narrowed = default_sync::<Widget>(
        &store,
        "acme",
        Duration::ZERO,
        Some(Filter::everything().add(FilterStat::field(
            "name",
            cirrus_store::FilterVerb::Equal,
            "creating",
        ))),
    )
    .await
    .unwrap();
    assert_eq!(narrowed.len(), 1);
}
