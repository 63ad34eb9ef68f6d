//! View projection with memoization
//!
//! Recomputes derived prices for a list of entities against the current rate
//! store. A breakdown is reused (same `Arc`) while the entity's mass, markup,
//! rate key and the rate for that key are unchanged.

use dashmap::DashMap;
use rayon::prelude::*;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use aurum_core::{EntityId, MarkupSpec, PricedEntity, ProjectedPrice, RateKey};
use aurum_price_feed::RateStore;

use crate::calculator::PriceCalculator;

#[derive(Debug, Clone, PartialEq)]
struct MemoKey {
    mass: Option<Decimal>,
    markup: Option<MarkupSpec>,
    rate_key: Option<RateKey>,
    rate: Option<Decimal>,
}

#[derive(Debug, Clone)]
struct MemoEntry {
    key: MemoKey,
    price: ProjectedPrice,
}

/// Projected prices in entity order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectedView {
    entries: Vec<(EntityId, ProjectedPrice)>,
    /// Position of each id in `entries`; the first wins on duplicates
    index: HashMap<EntityId, usize>,
}

impl ProjectedView {
    fn new(entries: Vec<(EntityId, ProjectedPrice)>) -> Self {
        let mut index = HashMap::with_capacity(entries.len());
        for (pos, (id, _)) in entries.iter().enumerate() {
            index.entry(id.clone()).or_insert(pos);
        }
        Self { entries, index }
    }

    pub fn get(&self, id: &EntityId) -> Option<&ProjectedPrice> {
        self.index.get(id).map(|&pos| &self.entries[pos].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(EntityId, ProjectedPrice)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn priced_count(&self) -> usize {
        self.entries.iter().filter(|(_, p)| p.is_priced()).count()
    }

    pub fn unpriced_count(&self) -> usize {
        self.len() - self.priced_count()
    }
}

/// Memoizing projector
#[derive(Debug)]
pub struct ViewProjector {
    memo: DashMap<EntityId, MemoEntry>,
    parallel_threshold: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ViewProjector {
    pub fn new(parallel_threshold: usize) -> Self {
        Self {
            memo: DashMap::new(),
            parallel_threshold: parallel_threshold.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Price every entity against the store. Entities whose key has no rate
    /// come back unpriced; nothing here fails.
    pub fn project(&self, entities: &[PricedEntity], store: &RateStore) -> ProjectedView {
        let entries: Vec<(EntityId, ProjectedPrice)> = if entities.len() >= self.parallel_threshold {
            entities
                .par_iter()
                .map(|e| (e.id.clone(), self.project_one(e, store)))
                .collect()
        } else {
            entities
                .iter()
                .map(|e| (e.id.clone(), self.project_one(e, store)))
                .collect()
        };

        // forget entities that left the list
        let live: HashSet<&EntityId> = entities.iter().map(|e| &e.id).collect();
        self.memo.retain(|id, _| live.contains(id));

        debug!(
            entities = entries.len(),
            memo = self.memo.len(),
            "Projected view"
        );

        ProjectedView::new(entries)
    }

    fn project_one(&self, entity: &PricedEntity, store: &RateStore) -> ProjectedPrice {
        let rate = entity
            .rate_key
            .as_ref()
            .and_then(|key| store.current_rate(key));
        let key = MemoKey {
            mass: entity.mass,
            markup: entity.markup,
            rate_key: entity.rate_key.clone(),
            rate,
        };

        let cached = self
            .memo
            .get(&entity.id)
            .filter(|entry| entry.key == key)
            .map(|entry| entry.price.clone());
        if let Some(price) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return price;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let price = match PriceCalculator::compute(entity, rate) {
            Ok(breakdown) => ProjectedPrice::Priced(Arc::new(breakdown)),
            Err(reason) => ProjectedPrice::Unpriced(reason),
        };
        self.memo.insert(
            entity.id.clone(),
            MemoEntry {
                key,
                price: price.clone(),
            },
        );
        price
    }

    /// Drop all memoized results
    pub fn clear(&self) {
        self.memo.clear();
    }

    pub fn stats(&self) -> ProjectorStats {
        ProjectorStats {
            memo_size: self.memo.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for ViewProjector {
    fn default() -> Self {
        Self::new(aurum_core::PricingConfig::default().parallel_threshold)
    }
}

/// Projector statistics
#[derive(Debug, Clone)]
pub struct ProjectorStats {
    pub memo_size: usize,
    pub hits: u64,
    pub misses: u64,
}
