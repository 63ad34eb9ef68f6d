//! Carat ladder derivation
//!
//! Feeds often publish only the 24K rate. When configured, lower purity
//! grades are derived from the base grade by carat ratio before a snapshot
//! reaches the store. Grades the feed publishes itself are never overwritten.

use rust_decimal::{Decimal, RoundingStrategy};

use aurum_core::{PurityLadderConfig, RateKey, RateSnapshot};

#[derive(Debug, Clone)]
pub struct PurityLadder {
    base: RateKey,
    base_carats: u32,
    derive: Vec<(RateKey, u32)>,
}

impl PurityLadder {
    /// `None` when the base grade is not a carat key
    pub fn new(config: &PurityLadderConfig) -> Option<Self> {
        let base_carats = config.base.carats()?;
        let derive = config
            .derive
            .iter()
            .filter_map(|key| key.carats().map(|c| (key.clone(), c)))
            .collect();

        Some(Self {
            base: config.base.clone(),
            base_carats,
            derive,
        })
    }

    pub fn apply(&self, snapshot: RateSnapshot) -> RateSnapshot {
        let Some(base_rate) = snapshot.rate(&self.base) else {
            return snapshot;
        };

        let missing: Vec<(RateKey, Decimal)> = self
            .derive
            .iter()
            .filter(|(key, _)| snapshot.rate(key).is_none())
            .map(|(key, carats)| {
                let rate = base_rate * Decimal::from(*carats) / Decimal::from(self.base_carats);
                (
                    key.clone(),
                    rate.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
                )
            })
            .collect();

        if missing.is_empty() {
            snapshot
        } else {
            snapshot.extended(missing)
        }
    }
}
