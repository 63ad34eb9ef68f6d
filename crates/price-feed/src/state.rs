//! Rate state management
//!
//! Holds the current and previous rate snapshot and reports which keys a new
//! snapshot actually changed.

use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use aurum_core::{RateKey, RateSnapshot};

/// Outcome of feeding one snapshot into the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeResult {
    /// Keys whose price was added, removed or changed
    pub changed: BTreeSet<RateKey>,
    /// First snapshot this store has ever accepted
    pub initial: bool,
    /// Snapshot was older than the stored one and was discarded
    pub superseded: bool,
}

impl ChangeResult {
    /// Whether downstream projections need to be recomputed
    pub fn has_changes(&self) -> bool {
        self.initial || !self.changed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    snapshot: Arc<RateSnapshot>,
    received_at: Instant,
}

/// Latest known rate per key, with staleness tracking
#[derive(Debug, Default)]
pub struct RateStore {
    current: Option<StoredSnapshot>,
    /// Kept only to decide whether an update is a change
    previous: Option<Arc<RateSnapshot>>,
    update_count: u64,
    superseded_count: u64,
}

impl RateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a new snapshot.
    ///
    /// Snapshots captured before the stored one are discarded. An equal
    /// snapshot replaces the stored one (refreshing its age) but reports no
    /// changed keys.
    pub fn update(&mut self, snapshot: RateSnapshot) -> ChangeResult {
        let Some(old) = self.current.as_ref().map(|c| Arc::clone(&c.snapshot)) else {
            let changed = snapshot.keys().cloned().collect();
            self.accept(snapshot);
            return ChangeResult {
                changed,
                initial: true,
                superseded: false,
            };
        };

        if snapshot.captured_at() < old.captured_at() {
            debug!(
                captured_at = %snapshot.captured_at(),
                current = %old.captured_at(),
                "Discarding superseded rate snapshot"
            );
            self.superseded_count += 1;
            return ChangeResult {
                superseded: true,
                ..Default::default()
            };
        }

        let changed = old
            .keys()
            .chain(snapshot.keys())
            .filter(|key| old.rate(key) != snapshot.rate(key))
            .cloned()
            .collect();

        self.accept(snapshot);
        ChangeResult {
            changed,
            initial: false,
            superseded: false,
        }
    }

    fn accept(&mut self, snapshot: RateSnapshot) {
        let entry = StoredSnapshot {
            snapshot: Arc::new(snapshot),
            received_at: Instant::now(),
        };
        self.previous = self.current.replace(entry).map(|e| e.snapshot);
        self.update_count += 1;
    }

    /// Latest known price for a key
    pub fn current_rate(&self, key: &RateKey) -> Option<Decimal> {
        self.current.as_ref().and_then(|c| c.snapshot.rate(key))
    }

    pub fn current(&self) -> Option<Arc<RateSnapshot>> {
        self.current.as_ref().map(|c| Arc::clone(&c.snapshot))
    }

    pub fn previous(&self) -> Option<Arc<RateSnapshot>> {
        self.previous.clone()
    }

    pub fn is_populated(&self) -> bool {
        self.current.is_some()
    }

    /// Time since the current snapshot was accepted
    pub fn age(&self) -> Option<Duration> {
        self.current.as_ref().map(|c| c.received_at.elapsed())
    }

    /// No snapshot yet, or the current one is at least `max_age` old
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.stale_at(max_age).map_or(true, |at| Instant::now() >= at)
    }

    /// When the current snapshot turns stale, if there is one
    pub fn stale_at(&self, max_age: Duration) -> Option<Instant> {
        self.current.as_ref().map(|c| c.received_at + max_age)
    }

    pub fn stats(&self) -> RateStoreStats {
        RateStoreStats {
            key_count: self.current.as_ref().map_or(0, |c| c.snapshot.len()),
            update_count: self.update_count,
            superseded_count: self.superseded_count,
            age: self.age(),
        }
    }
}

/// Statistics about the rate store
#[derive(Debug, Clone)]
pub struct RateStoreStats {
    pub key_count: usize,
    pub update_count: u64,
    pub superseded_count: u64,
    pub age: Option<Duration>,
}
