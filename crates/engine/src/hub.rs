//! Singleton-per-feed sharing of reconciliation loops
//!
//! Screens that need the same feed lease one shared loop instead of opening
//! their own connection. The first lease starts the loop and releasing the
//! last one stops it. Starting and stopping one feed are serialized, so a
//! lease taken while the previous loop is still shutting down waits for it
//! and then gets a fresh loop.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use aurum_core::{EngineConfig, EngineResult};
use aurum_price_feed::{PushChannel, RateSource};

use crate::reconciliation::ReconciliationLoop;

type Lifecycle = Arc<AsyncMutex<()>>;

struct HubEntry {
    engine: Arc<ReconciliationLoop>,
    leases: usize,
    /// Held while the loop is started or stopped
    lifecycle: Lifecycle,
}

struct HubInner {
    push: Arc<dyn PushChannel>,
    source: Arc<dyn RateSource>,
    loops: DashMap<String, HubEntry>,
}

impl HubInner {
    /// Existing entry for the feed, or a new idle one
    fn slot(&self, config: &EngineConfig) -> EngineResult<(Arc<ReconciliationLoop>, Lifecycle)> {
        let name = &config.feed.name;
        let entry = match self.loops.entry(name.clone()) {
            Entry::Occupied(occupied) => {
                debug!(feed = %name, "Sharing feed");
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => {
                let engine = ReconciliationLoop::new(
                    config.clone(),
                    Arc::clone(&self.push),
                    Arc::clone(&self.source),
                )?;
                vacant.insert(HubEntry {
                    engine: Arc::new(engine),
                    leases: 0,
                    lifecycle: Arc::new(AsyncMutex::new(())),
                })
            }
        };
        Ok((Arc::clone(&entry.engine), Arc::clone(&entry.lifecycle)))
    }

    /// Drop one lease; returns the leases left. Caller holds the lifecycle.
    fn drop_lease(&self, name: &str) -> Option<usize> {
        self.loops.get_mut(name).map(|mut entry| {
            entry.leases = entry.leases.saturating_sub(1);
            entry.leases
        })
    }

    /// Forget a loop that has no leases. Caller holds the lifecycle.
    fn retire(&self, name: &str, engine: &Arc<ReconciliationLoop>) {
        self.loops
            .remove_if(name, |_, entry| entry.leases == 0 && Arc::ptr_eq(&entry.engine, engine));
    }

    async fn release(&self, name: &str, engine: &Arc<ReconciliationLoop>, lifecycle: &Lifecycle) {
        let _guard = lifecycle.lock().await;
        if self.drop_lease(name) == Some(0) {
            engine.stop().await;
            self.retire(name, engine);
            info!(feed = %name, "Last lease released");
        }
    }

    fn release_now(&self, name: &str, engine: &Arc<ReconciliationLoop>) {
        if self.drop_lease(name) == Some(0) {
            engine.halt();
            self.retire(name, engine);
            info!(feed = %name, "Last lease dropped");
        }
    }
}

/// Registry of running feeds
#[derive(Clone)]
pub struct FeedHub {
    inner: Arc<HubInner>,
}

impl FeedHub {
    pub fn new(push: Arc<dyn PushChannel>, source: Arc<dyn RateSource>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                push,
                source,
                loops: DashMap::new(),
            }),
        }
    }

    /// Lease the loop for `config.feed.name`, starting it if nobody holds it.
    /// A later lease on the same feed shares the running loop; its config is
    /// ignored. Waits for a loop that is still stopping.
    pub async fn acquire(&self, config: EngineConfig) -> EngineResult<FeedLease> {
        let name = config.feed.name.clone();

        loop {
            let (engine, lifecycle) = self.inner.slot(&config)?;
            let _guard = lifecycle.lock().await;

            // retired while we waited; take a fresh slot
            let Some(mut entry) = self.inner.loops.get_mut(&name) else {
                continue;
            };
            if !Arc::ptr_eq(&entry.engine, &engine) {
                continue;
            }

            if !engine.is_running() {
                if let Err(e) = engine.start() {
                    drop(entry);
                    self.inner.retire(&name, &engine);
                    return Err(e);
                }
            }
            entry.leases += 1;
            let leases = entry.leases;
            drop(entry);

            info!(feed = %name, leases, "Feed leased");
            return Ok(FeedLease {
                hub: Arc::clone(&self.inner),
                name,
                engine,
                lifecycle: Arc::clone(&lifecycle),
                released: false,
            });
        }
    }

    pub fn lease_count(&self, name: &str) -> usize {
        self.inner.loops.get(name).map_or(0, |e| e.leases)
    }

    pub fn active_feeds(&self) -> usize {
        self.inner.loops.len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ReconciliationLoop>> {
        self.inner.loops.get(name).map(|e| Arc::clone(&e.engine))
    }
}

impl std::fmt::Debug for FeedHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHub")
            .field("active_feeds", &self.active_feeds())
            .finish()
    }
}

/// Shared handle on one feed's loop. Derefs to the loop.
pub struct FeedLease {
    hub: Arc<HubInner>,
    name: String,
    engine: Arc<ReconciliationLoop>,
    lifecycle: Lifecycle,
    released: bool,
}

impl FeedLease {
    pub fn engine(&self) -> &Arc<ReconciliationLoop> {
        &self.engine
    }

    /// Give the lease back, stopping the loop if this was the last one
    pub async fn release(mut self) {
        self.released = true;
        self.hub.release(&self.name, &self.engine, &self.lifecycle).await;
    }
}

impl Deref for FeedLease {
    type Target = ReconciliationLoop;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl Drop for FeedLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Ok(_guard) = self.lifecycle.try_lock() {
            self.hub.release_now(&self.name, &self.engine);
            return;
        }

        // a start or stop of this feed is in progress
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let hub = Arc::clone(&self.hub);
                let name = self.name.clone();
                let engine = Arc::clone(&self.engine);
                let lifecycle = Arc::clone(&self.lifecycle);
                handle.spawn(async move { hub.release(&name, &engine, &lifecycle).await });
            }
            Err(_) => self.hub.release_now(&self.name, &self.engine),
        }
    }
}

impl std::fmt::Debug for FeedLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedLease")
            .field("feed", &self.name)
            .field("released", &self.released)
            .finish()
    }
}
