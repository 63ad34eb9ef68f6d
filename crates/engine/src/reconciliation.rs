//! Reconciliation loop
//!
//! Owns one feed's lifecycle: spawns the [`FeedConnector`], feeds its
//! snapshots into the [`RateStore`], reprojects the entity list when rates
//! actually change, and publishes the result to subscribers.
//!
//! Publishing happens under a gate that also records the active run. `stop()`
//! closes the gate before tearing the connector down, so a callback that is
//! running finishes first and nothing is published once `stop()` returns,
//! including results of requests that were still in flight.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use aurum_core::{
    ConnectionState, EngineConfig, EngineError, EngineResult, PricedEntity, RateSnapshot,
};
use aurum_price_feed::{FeedConnector, FeedEvent, PushChannel, RateSource, RateStore, RateStoreStats};
use aurum_pricing::{ProjectedView, ViewProjector};

use crate::subscribers::{SubscriberRegistry, Subscription};

const EVENT_BUFFER: usize = 64;

/// Immutable view handed to subscribers
#[derive(Debug, Clone)]
pub struct LiveView {
    /// Prices in entity order
    pub prices: ProjectedView,
    /// Snapshot the prices were computed from
    pub snapshot: Option<Arc<RateSnapshot>>,
    pub state: ConnectionState,
    /// Rates are older than `max_rate_age_secs`; still shown, never hidden
    pub stale: bool,
    pub generated_at: DateTime<Utc>,
}

struct Shared {
    config: EngineConfig,
    store: RwLock<RateStore>,
    projector: ViewProjector,
    entities: RwLock<Arc<Vec<PricedEntity>>>,
    state: RwLock<ConnectionState>,
    latest: RwLock<Option<Arc<LiveView>>>,
    subscribers: Arc<SubscriberRegistry>,
    /// Generation of the active run, 0 when stopped. Reentrant so a
    /// listener may call back into the loop (e.g. `set_entities`).
    gate: ReentrantMutex<Cell<u64>>,
}

impl Shared {
    async fn consume(self: Arc<Self>, mut events: mpsc::Receiver<FeedEvent>, generation: u64) {
        loop {
            let deadline = self.stale_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(FeedEvent::State(state)) => self.on_state(state, generation),
                    Some(FeedEvent::Snapshot(snapshot)) => self.on_snapshot(snapshot, generation),
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_stale(generation);
                }
            }
        }
        debug!(feed = %self.config.feed.name, generation, "Feed event stream closed");
    }

    fn on_state(&self, state: ConnectionState, generation: u64) {
        let gate = self.gate.lock();
        if gate.get() != generation {
            return;
        }
        *self.state.write() = state;
        self.publish();
    }

    fn on_snapshot(&self, snapshot: RateSnapshot, generation: u64) {
        let gate = self.gate.lock();
        if gate.get() != generation {
            debug!(feed = %self.config.feed.name, "Dropping snapshot from a stopped run");
            return;
        }

        let change = self.store.write().update(snapshot);
        if !change.has_changes() {
            // same rates, but a stale view needs to learn they are current again
            if self.published_stale() && !self.rates_stale() {
                info!(feed = %self.config.feed.name, "Rates confirmed, no longer stale");
                self.publish();
            }
            return;
        }

        info!(
            feed = %self.config.feed.name,
            changed = change.changed.len(),
            initial = change.initial,
            "Rates changed"
        );
        self.publish();
    }

    fn on_stale(&self, generation: u64) {
        let gate = self.gate.lock();
        if gate.get() != generation || self.published_stale() || !self.rates_stale() {
            return;
        }

        warn!(
            feed = %self.config.feed.name,
            max_age_secs = self.config.feed.max_rate_age_secs,
            "Rates went stale"
        );
        self.publish();
    }

    /// Next instant the published view would go out of date by ageing alone
    fn stale_deadline(&self) -> Option<Instant> {
        if self.published_stale() {
            return None;
        }
        self.store.read().stale_at(self.config.feed.max_rate_age())
    }

    fn published_stale(&self) -> bool {
        self.latest.read().as_ref().map_or(false, |view| view.stale)
    }

    fn rates_stale(&self) -> bool {
        let store = self.store.read();
        store.is_populated() && store.is_stale(self.config.feed.max_rate_age())
    }

    /// Caller holds the gate
    fn publish(&self) {
        let view = Arc::new(self.build_view());
        *self.latest.write() = Some(Arc::clone(&view));
        self.subscribers.notify(&view, view.state);
    }

    fn build_view(&self) -> LiveView {
        let entities = Arc::clone(&self.entities.read());
        let store = self.store.read();

        LiveView {
            prices: self.projector.project(&entities, &store),
            snapshot: store.current(),
            state: *self.state.read(),
            stale: store.is_populated() && store.is_stale(self.config.feed.max_rate_age()),
            generated_at: Utc::now(),
        }
    }

    fn is_active(&self) -> bool {
        self.gate.lock().get() != 0
    }
}

struct Running {
    generation: u64,
    connector: FeedConnector,
    consumer: JoinHandle<()>,
}

/// Live pricing loop for one feed
pub struct ReconciliationLoop {
    shared: Arc<Shared>,
    push: Arc<dyn PushChannel>,
    source: Arc<dyn RateSource>,
    running: Mutex<Option<Running>>,
    generations: AtomicU64,
}

impl ReconciliationLoop {
    pub fn new(
        config: EngineConfig,
        push: Arc<dyn PushChannel>,
        source: Arc<dyn RateSource>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let projector = ViewProjector::new(config.pricing.parallel_threshold);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store: RwLock::new(RateStore::new()),
                projector,
                entities: RwLock::new(Arc::new(Vec::new())),
                state: RwLock::new(ConnectionState::Disconnected),
                latest: RwLock::new(None),
                subscribers: Arc::new(SubscriberRegistry::new()),
                gate: ReentrantMutex::new(Cell::new(0)),
            }),
            push,
            source,
            running: Mutex::new(None),
            generations: AtomicU64::new(0),
        })
    }

    pub fn feed_name(&self) -> &str {
        &self.shared.config.feed.name
    }

    /// Spawn the connector and start publishing. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) -> EngineResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        self.shared.gate.lock().set(generation);
        let connector = FeedConnector::spawn(
            self.shared.config.feed.clone(),
            Arc::clone(&self.push),
            Arc::clone(&self.source),
            events_tx,
        );
        let consumer = tokio::spawn(Arc::clone(&self.shared).consume(events_rx, generation));

        *running = Some(Running {
            generation,
            connector,
            consumer,
        });

        info!(feed = %self.feed_name(), generation, "Reconciliation loop started");
        Ok(())
    }

    /// Tear the run down. When this returns the push channel is closed, no
    /// timer is pending and no callback will fire. Stopping a loop that is
    /// not running does nothing.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        self.shared.gate.lock().set(0);
        running.consumer.abort();
        running.connector.stop().await;
        let _ = running.consumer.await;
        *self.shared.state.write() = ConnectionState::Disconnected;

        info!(feed = %self.feed_name(), generation = running.generation, "Reconciliation loop stopped");
    }

    /// Synchronous teardown for drop paths; tasks are aborted, not awaited
    pub fn halt(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        self.shared.gate.lock().set(0);
        running.consumer.abort();
        drop(running.connector);
        *self.shared.state.write() = ConnectionState::Disconnected;

        info!(feed = %self.feed_name(), generation = running.generation, "Reconciliation loop halted");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Register a listener for published views. No replay: use
    /// [`latest_view`](Self::latest_view) for the current one.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LiveView, ConnectionState) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(listener)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Replace the priced collection. Republishes right away while running;
    /// the feed connection is left alone.
    pub fn set_entities(&self, entities: Vec<PricedEntity>) {
        debug!(feed = %self.feed_name(), count = entities.len(), "Entity list replaced");
        *self.shared.entities.write() = Arc::new(entities);

        let gate = self.shared.gate.lock();
        if gate.get() != 0 {
            self.shared.publish();
        }
    }

    pub fn entities(&self) -> Arc<Vec<PricedEntity>> {
        Arc::clone(&self.shared.entities.read())
    }

    /// Project the current entities against the current rates without
    /// publishing
    pub fn project_now(&self) -> EngineResult<LiveView> {
        let gate = self.shared.gate.lock();
        if gate.get() == 0 {
            return Err(EngineError::NotStarted);
        }
        Ok(self.shared.build_view())
    }

    pub fn snapshot_now(&self) -> Option<Arc<RateSnapshot>> {
        self.shared.store.read().current()
    }

    pub fn latest_view(&self) -> Option<Arc<LiveView>> {
        self.shared.latest.read().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Ask the connector to retry its push channel
    pub fn force_reconnect(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |r| r.connector.force_reconnect())
    }

    pub fn store_stats(&self) -> RateStoreStats {
        self.shared.store.read().stats()
    }

    pub fn is_publishing(&self) -> bool {
        self.shared.is_active()
    }
}

impl Drop for ReconciliationLoop {
    fn drop(&mut self) {
        self.halt();
    }
}

impl std::fmt::Debug for ReconciliationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationLoop")
            .field("feed", &self.feed_name())
            .field("running", &self.is_running())
            .field("state", &self.connection_state())
            .finish()
    }
}
