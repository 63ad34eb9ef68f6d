//! Log lines for published views

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use aurum_core::{ConnectionState, ProjectedPrice};
use aurum_engine::LiveView;

/// Compact summary of one published view
#[derive(Debug, Clone, Serialize)]
pub struct ViewSummary {
    pub state: String,
    pub stale: bool,
    pub priced: usize,
    pub unpriced: usize,
    pub rates: BTreeMap<String, Decimal>,
}

impl ViewSummary {
    pub fn new(view: &LiveView, state: ConnectionState) -> Self {
        let rates = view
            .snapshot
            .as_ref()
            .map(|s| {
                s.rates()
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            state: state.name().to_string(),
            stale: view.stale,
            priced: view.prices.priced_count(),
            unpriced: view.prices.unpriced_count(),
            rates,
        }
    }

    pub fn rates_json(&self) -> String {
        serde_json::to_string(&self.rates).unwrap_or_default()
    }
}

/// Subscriber callback: one info line per view, one debug line per product
pub fn log_view(view: &LiveView, state: ConnectionState) {
    let summary = ViewSummary::new(view, state);
    info!(
        state = %summary.state,
        stale = summary.stale,
        priced = summary.priced,
        unpriced = summary.unpriced,
        rates = %summary.rates_json(),
        "Price view published"
    );

    for (id, price) in view.prices.iter() {
        match price {
            ProjectedPrice::Priced(b) => debug!(
                product = %id,
                base = %b.base_amount(),
                markup = %b.markup_amount(),
                total = %b.total_amount(),
                "Priced"
            ),
            ProjectedPrice::Unpriced(reason) => debug!(product = %id, reason = %reason, "Unpriced"),
        }
    }
}
