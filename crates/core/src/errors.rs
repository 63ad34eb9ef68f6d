//! Error types

use rust_decimal::Decimal;
use thiserror::Error;

use crate::RateKey;

/// Rate table validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("Rate table is empty")]
    Empty,

    #[error("Rate key is empty")]
    EmptyKey,

    #[error("Price for {key} must be positive, got {price}")]
    NonPositivePrice { key: RateKey, price: Decimal },
}

/// Price feed errors
///
/// These never reach the UI as failures; the connector turns them into
/// connection state changes and log lines.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Push channel connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid message format: {0}")]
    Malformed(String),

    #[error("Invalid rate table: {0}")]
    InvalidRate(#[from] SnapshotError),

    #[error("Feed disconnected")]
    Disconnected,
}

/// Engine lifecycle and configuration errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Reconciliation loop has not been started")]
    NotStarted,

    #[error("Reconciliation loop is already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type alias
pub type FeedResult<T> = Result<T, FeedError>;
pub type EngineResult<T> = Result<T, EngineError>;
