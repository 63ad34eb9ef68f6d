//! Priced catalog entities and derived price breakdowns

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::{EntityId, RateKey};

/// Charge added on top of the gold value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MarkupSpec {
    /// Percentage of the base gold value
    Percentage(Decimal),
    /// Flat amount per unit of mass (per gram)
    FlatPerUnit(Decimal),
}

impl MarkupSpec {
    pub fn value(&self) -> Decimal {
        match self {
            MarkupSpec::Percentage(v) | MarkupSpec::FlatPerUnit(v) => *v,
        }
    }
}

impl fmt::Display for MarkupSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkupSpec::Percentage(p) => write!(f, "{}%", p),
            MarkupSpec::FlatPerUnit(m) => write!(f, "{}/g", m),
        }
    }
}

/// A catalog entry the engine prices. Owned by the catalog; the engine only
/// reads these fields.
///
/// Fields are optional because catalog data is not validated upstream: a
/// missing or non-numeric value makes the entity unpriced instead of failing
/// the whole projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricedEntity {
    pub id: EntityId,
    pub name: Option<String>,
    pub mass: Option<Decimal>,
    pub rate_key: Option<RateKey>,
    pub markup: Option<MarkupSpec>,
}

impl PricedEntity {
    pub fn new(
        id: impl Into<String>,
        mass: Decimal,
        rate_key: impl Into<RateKey>,
        markup: MarkupSpec,
    ) -> Self {
        Self {
            id: EntityId::new(id),
            name: None,
            mass: Some(mass),
            rate_key: Some(rate_key.into()),
            markup: Some(markup),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Wire shape of a catalog product, accepting the backend's field names
#[derive(Debug, Deserialize)]
struct CatalogRecord {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "netWeight", alias = "weight", deserialize_with = "lenient_decimal")]
    mass: Option<Decimal>,
    #[serde(default, alias = "carat", alias = "rateKey", deserialize_with = "lenient_key")]
    rate_key: Option<RateKey>,
    #[serde(default, deserialize_with = "lenient_markup")]
    markup: Option<MarkupSpec>,
    #[serde(default, alias = "makingChargePercent", deserialize_with = "lenient_decimal")]
    markup_percent: Option<Decimal>,
    #[serde(default, alias = "makingCharge", deserialize_with = "lenient_decimal")]
    markup_per_unit: Option<Decimal>,
}

impl<'de> Deserialize<'de> for PricedEntity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = CatalogRecord::deserialize(deserializer)?;
        let markup = record
            .markup
            .or_else(|| record.markup_percent.map(MarkupSpec::Percentage))
            .or_else(|| record.markup_per_unit.map(MarkupSpec::FlatPerUnit));

        Ok(PricedEntity {
            id: EntityId::new(record.id),
            name: record.name,
            mass: record.mass,
            rate_key: record.rate_key,
            markup,
        })
    }
}

/// Rate key from a JSON carat field: `"22k"`, `22` and `22.0` all give `22K`
pub fn rate_key_from_json(value: &serde_json::Value) -> Option<RateKey> {
    match value {
        serde_json::Value::String(s) => Some(RateKey::new(s)).filter(|k| !k.is_empty()),
        serde_json::Value::Number(n) => {
            let whole = n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u32::MAX as f64)
                    .map(|f| f as u64)
            });
            Some(match whole {
                Some(carats) => RateKey::new(format!("{}K", carats)),
                None => RateKey::new(format!("{}K", n)),
            })
        }
        _ => None,
    }
}

/// Parse a JSON number or numeric string; anything else becomes `None`
pub fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn lenient_decimal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Decimal>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(decimal_from_json(&value))
}

fn lenient_key<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<RateKey>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(rate_key_from_json(&value))
}

fn lenient_markup<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<MarkupSpec>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Derived monetary breakdown for one entity.
///
/// `total_amount == base_amount + markup_amount` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceBreakdown {
    base_amount: Decimal,
    markup_amount: Decimal,
    total_amount: Decimal,
}

impl PriceBreakdown {
    pub fn new(base_amount: Decimal, markup_amount: Decimal) -> Self {
        Self {
            base_amount,
            markup_amount,
            total_amount: base_amount + markup_amount,
        }
    }

    pub fn base_amount(&self) -> Decimal {
        self.base_amount
    }

    pub fn markup_amount(&self) -> Decimal {
        self.markup_amount
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_amount
    }
}

/// Why an entity could not be priced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnpricedReason {
    /// Entity has no rate key (e.g. no carat selected)
    MissingRateKey,
    /// No rate known for the entity's key
    UnknownRate,
    /// Rate present but not strictly positive
    InvalidRate,
    /// Mass missing, non-numeric, zero or negative
    InvalidMass,
    /// Markup missing, non-numeric or negative
    InvalidMarkup,
    /// Amount does not fit the decimal range
    Overflow,
}

impl fmt::Display for UnpricedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnpricedReason::MissingRateKey => "missing rate key",
            UnpricedReason::UnknownRate => "unknown rate",
            UnpricedReason::InvalidRate => "invalid rate",
            UnpricedReason::InvalidMass => "invalid mass",
            UnpricedReason::InvalidMarkup => "invalid markup",
            UnpricedReason::Overflow => "amount overflow",
        };
        f.write_str(text)
    }
}

/// Projection result for one entity
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedPrice {
    Priced(Arc<PriceBreakdown>),
    Unpriced(UnpricedReason),
}

impl ProjectedPrice {
    pub fn breakdown(&self) -> Option<&Arc<PriceBreakdown>> {
        match self {
            ProjectedPrice::Priced(b) => Some(b),
            ProjectedPrice::Unpriced(_) => None,
        }
    }

    pub fn is_priced(&self) -> bool {
        matches!(self, ProjectedPrice::Priced(_))
    }

    /// Same breakdown allocation (memoized) or same unpriced reason
    pub fn same_instance(&self, other: &ProjectedPrice) -> bool {
        match (self, other) {
            (ProjectedPrice::Priced(a), ProjectedPrice::Priced(b)) => Arc::ptr_eq(a, b),
            (ProjectedPrice::Unpriced(a), ProjectedPrice::Unpriced(b)) => a == b,
            _ => false,
        }
    }
}
