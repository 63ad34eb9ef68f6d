//! Live pricing engine
//!
//! Features:
//! - One reconciliation loop per feed: connector -> rate store -> projection
//! - Change-driven publishing to subscribers, never after `stop()`
//! - Singleton-per-feed sharing through reference-counted leases

pub mod hub;
pub mod reconciliation;
pub mod subscribers;

pub use hub::{FeedHub, FeedLease};
pub use reconciliation::{LiveView, ReconciliationLoop};
pub use subscribers::{SubscriberRegistry, Subscription};
