//! Core types for the live gold-rate pricing engine
//!
//! This crate provides shared types used across all components:
//! - Rate keys and rate snapshots
//! - Priced catalog entities and price breakdowns
//! - Connection state
//! - Configuration and errors

pub mod types;
pub mod rates;
pub mod entities;
pub mod config;
pub mod errors;

pub use types::*;
pub use rates::*;
pub use entities::*;
pub use crate::config::*;
pub use errors::*;
