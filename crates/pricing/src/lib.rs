//! Derived pricing for catalog entities
//!
//! Features:
//! - One pricing formula with explicit percentage / flat-per-gram markup
//! - Memoized projection over the whole catalog
//! - Parallel projection with rayon for large catalogs

pub mod calculator;
pub mod projector;

pub use calculator::{round_money, PriceCalculator};
pub use projector::{ProjectedView, ProjectorStats, ViewProjector};
