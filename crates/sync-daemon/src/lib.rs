//! Live gold price sync daemon
//!
//! Loads the product catalog, keeps it priced against the live gold feed and
//! reports every published view.

pub mod catalog;
pub mod report;

pub use catalog::{load_catalog, parse_catalog, CatalogError};
pub use report::ViewSummary;
