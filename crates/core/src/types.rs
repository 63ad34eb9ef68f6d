//! Core type definitions

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Pricing tier identifier, e.g. a purity grade like "22K".
///
/// Keys are compared by value after normalization (trimmed, upper-cased), so
/// "22k" and " 22K" address the same rate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RateKey(String);

impl RateKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(key.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Carat number for purity-grade keys ("22K" -> 22)
    pub fn carats(&self) -> Option<u32> {
        let digits = self.0.strip_suffix('K').unwrap_or(&self.0);
        digits.parse().ok().filter(|c| (1..=24).contains(c))
    }
}

impl From<String> for RateKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for RateKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<RateKey> for String {
    fn from(key: RateKey) -> Self {
        key.0
    }
}

impl Borrow<str> for RateKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Catalog identifier of a priced entity (the backend's `_id`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the connector is obtaining rates while the push channel is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    Polling,
}

/// Feed connection status, as shown by the "live" / "polling" indicator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Live,
    Degraded(FallbackMode),
    #[default]
    Disconnected,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Live => "live",
            ConnectionState::Degraded(FallbackMode::Polling) => "polling",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Live)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ConnectionState::Degraded(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
