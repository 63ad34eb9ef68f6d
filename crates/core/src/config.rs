//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::{EngineError, EngineResult, RateKey};

/// Carat ladder used to fill purity grades the feed does not publish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurityLadderConfig {
    /// Grade whose rate the others are derived from
    pub base: RateKey,
    /// Grades to derive as `base_rate * carats / base_carats`
    pub derive: Vec<RateKey>,
}

impl Default for PurityLadderConfig {
    fn default() -> Self {
        Self {
            base: RateKey::new("24K"),
            derive: vec![RateKey::new("22K"), RateKey::new("18K")],
        }
    }
}

/// Price feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Feed identity; one reconciliation loop exists per name
    pub name: String,
    /// WebSocket endpoint; without one the connector starts in polling mode
    pub push_url: Option<String>,
    /// Sent once after the push channel opens
    pub subscribe_message: Option<String>,
    pub poll_url: String,
    pub poll_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Key assigned to rate records that carry none
    pub default_rate_key: RateKey,
    pub max_rate_age_secs: u64,
    pub purity: Option<PurityLadderConfig>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            name: "gold".to_string(),
            push_url: None,
            subscribe_message: None,
            poll_url: "http://localhost:8000/gold-price/todayPrice".to_string(),
            poll_interval_secs: 30,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            default_rate_key: RateKey::new("24K"),
            max_rate_age_secs: 120,
            purity: None,
        }
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_rate_age(&self) -> Duration {
        Duration::from_secs(self.max_rate_age_secs)
    }

    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = Some(url.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs().max(1);
        self
    }
}

/// Projection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Entity count from which projection fans out across the rayon pool
    pub parallel_threshold: usize,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 512,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub feed: FeedConfig,
    pub pricing: PricingConfig,
}

impl EngineConfig {
    /// Defaults, then the optional TOML file, then `AURUM__*` environment variables
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("AURUM")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let feed = &self.feed;
        if feed.name.trim().is_empty() {
            return Err(EngineError::InvalidConfig("feed.name is empty".into()));
        }
        if feed.poll_url.trim().is_empty() {
            return Err(EngineError::InvalidConfig("feed.poll_url is empty".into()));
        }
        if feed.poll_interval_secs == 0 {
            return Err(EngineError::InvalidConfig(
                "feed.poll_interval_secs must be positive".into(),
            ));
        }
        if feed.connect_timeout_ms == 0 || feed.request_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig("feed timeouts must be positive".into()));
        }
        if feed.default_rate_key.is_empty() {
            return Err(EngineError::InvalidConfig("feed.default_rate_key is empty".into()));
        }
        if let Some(purity) = &feed.purity {
            if purity.base.carats().is_none() {
                return Err(EngineError::InvalidConfig(format!(
                    "purity base {} is not a carat grade",
                    purity.base
                )));
            }
            if let Some(bad) = purity.derive.iter().find(|k| k.carats().is_none()) {
                return Err(EngineError::InvalidConfig(format!(
                    "purity grade {} is not a carat grade",
                    bad
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.feed.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.feed.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = EngineConfig::default();
        config.feed.poll_interval_secs = 0;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_non_carat_purity_grade() {
        let mut config = EngineConfig::default();
        config.feed.purity = Some(PurityLadderConfig {
            base: RateKey::new("24K"),
            derive: vec![RateKey::new("platinum")],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
            [feed]
            name = "gold-inr"
            push_url = "wss://rates.example/ws"
            poll_interval_secs = 15
        "#;
        let config: EngineConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.feed.name, "gold-inr");
        assert_eq!(config.feed.push_url.as_deref(), Some("wss://rates.example/ws"));
        assert_eq!(config.feed.poll_interval_secs, 15);
        assert_eq!(config.feed.connect_timeout_ms, 5_000);
        assert_eq!(config.pricing.parallel_threshold, 512);
    }
}
