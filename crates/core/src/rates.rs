//! Rate snapshots

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{RateKey, SnapshotError};

/// One rate table read from the feed.
///
/// Every price is strictly positive. Snapshots are never mutated once built;
/// a newer one replaces the old one as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshot {
    rates: BTreeMap<RateKey, Decimal>,
    /// When the read that produced this table was issued (poll) or received (push)
    captured_at: DateTime<Utc>,
    /// Timestamp carried by the payload itself, informational only
    source_time: Option<DateTime<Utc>>,
}

impl RateSnapshot {
    pub fn new(
        rates: impl IntoIterator<Item = (RateKey, Decimal)>,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, SnapshotError> {
        let mut table = BTreeMap::new();
        for (key, price) in rates {
            if key.is_empty() {
                return Err(SnapshotError::EmptyKey);
            }
            if price <= Decimal::ZERO {
                return Err(SnapshotError::NonPositivePrice { key, price });
            }
            table.insert(key, price);
        }

        if table.is_empty() {
            return Err(SnapshotError::Empty);
        }

        Ok(Self {
            rates: table,
            captured_at,
            source_time: None,
        })
    }

    pub fn with_source_time(mut self, source_time: Option<DateTime<Utc>>) -> Self {
        self.source_time = source_time;
        self
    }

    pub fn rate(&self, key: &RateKey) -> Option<Decimal> {
        self.rates.get(key).copied()
    }

    pub fn rates(&self) -> &BTreeMap<RateKey, Decimal> {
        &self.rates
    }

    pub fn keys(&self) -> impl Iterator<Item = &RateKey> {
        self.rates.keys()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn source_time(&self) -> Option<DateTime<Utc>> {
        self.source_time
    }

    /// Same keys with numerically equal prices, regardless of capture time
    pub fn same_rates(&self, other: &RateSnapshot) -> bool {
        self.rates == other.rates
    }

    /// Copy of this table with extra keys filled in; existing keys win
    pub fn extended(&self, extra: impl IntoIterator<Item = (RateKey, Decimal)>) -> Self {
        let mut rates = self.rates.clone();
        for (key, price) in extra {
            if price > Decimal::ZERO && !key.is_empty() {
                rates.entry(key).or_insert(price);
            }
        }
        Self {
            rates,
            captured_at: self.captured_at,
            source_time: self.source_time,
        }
    }
}
