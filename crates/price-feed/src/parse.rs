//! Rate payload decoding
//!
//! Accepted shapes, for both poll responses and push messages:
//! - an array of rate records, or a single record
//! - either of the above wrapped in `{"data": ...}` or `{"rates": ...}`
//! - a `{"rates": {"24K": 6000, "22K": "5500"}}` map
//!
//! A record is `{key|carat|purity, pricePerUnit|price|rate|TodayGoldPricePerGram}`
//! with an optional `updatedAt`/`createdAt`/`timestamp`. Records without a key
//! get the feed's default key.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use aurum_core::{
    decimal_from_json, rate_key_from_json, FeedError, FeedResult, RateKey, RateSnapshot,
};

const KEY_FIELDS: &[&str] = &["key", "carat", "purity", "rateKey"];
const PRICE_FIELDS: &[&str] = &[
    "pricePerUnit",
    "price",
    "rate",
    "TodayGoldPricePerGram",
    "todayGoldPricePerGram",
];
const TIME_FIELDS: &[&str] = &["updatedAt", "createdAt", "timestamp"];
const WRAPPER_FIELDS: &[&str] = &["data", "rates"];

const REFRESH_EVENTS: &[&str] = &["price_changed", "priceUpdated", "gold-price-updated", "refresh"];
const IGNORED_EVENTS: &[&str] = &["ping", "pong", "heartbeat", "subscribed", "welcome"];

/// Decoded rate records, not yet stamped with a capture time
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    pub rates: BTreeMap<RateKey, Decimal>,
    /// Latest timestamp carried by the records themselves
    pub source_time: Option<DateTime<Utc>>,
}

impl RateTable {
    pub fn into_snapshot(self, captured_at: DateTime<Utc>) -> FeedResult<RateSnapshot> {
        let snapshot = RateSnapshot::new(self.rates, captured_at)?;
        Ok(snapshot.with_source_time(self.source_time))
    }
}

/// Classified push channel message
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    /// Full rate table
    Table(RateTable),
    /// Rates changed upstream; fetch the table
    Refresh,
    /// Keep-alives and subscription acks
    Ignored,
}

/// Decode a poll response body
pub fn parse_rate_table(body: &str, default_key: &RateKey) -> FeedResult<RateTable> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| FeedError::Malformed(e.to_string()))?;

    table_from_value(&value, default_key)?
        .ok_or_else(|| FeedError::Malformed("no rate records in payload".into()))
}

/// Decode and classify a push channel message
pub fn parse_push_message(text: &str, default_key: &RateKey) -> FeedResult<PushMessage> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("refresh") {
        return Ok(PushMessage::Refresh);
    }
    if trimmed.eq_ignore_ascii_case("ping") || trimmed.eq_ignore_ascii_case("pong") {
        return Ok(PushMessage::Ignored);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| FeedError::Malformed(e.to_string()))?;

    if let Some(table) = table_from_value(&value, default_key)? {
        return Ok(PushMessage::Table(table));
    }

    let Value::Object(obj) = &value else {
        return Err(FeedError::Malformed("unexpected push payload".into()));
    };

    // JSON-RPC style subscription acks
    if obj.contains_key("result") && !obj.contains_key("type") && !obj.contains_key("event") {
        return Ok(PushMessage::Ignored);
    }

    let event = obj
        .get("type")
        .or_else(|| obj.get("event"))
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::Malformed("push message has no type".into()))?;

    if REFRESH_EVENTS.iter().any(|e| e.eq_ignore_ascii_case(event)) {
        Ok(PushMessage::Refresh)
    } else if IGNORED_EVENTS.iter().any(|e| e.eq_ignore_ascii_case(event)) {
        Ok(PushMessage::Ignored)
    } else {
        Err(FeedError::Malformed(format!("unknown push event {}", event)))
    }
}

/// `Ok(None)` when the value carries no rate data at all
fn table_from_value(value: &Value, default_key: &RateKey) -> FeedResult<Option<RateTable>> {
    match value {
        Value::Array(items) => {
            let records = items
                .iter()
                .map(|item| match item {
                    Value::Object(obj) if is_record(obj) => Ok(obj),
                    _ => Err(FeedError::Malformed("array element is not a rate record".into())),
                })
                .collect::<FeedResult<Vec<_>>>()?;
            build_table(&records, default_key).map(Some)
        }
        Value::Object(obj) if is_record(obj) => build_table(&[obj], default_key).map(Some),
        Value::Object(obj) => {
            for field in WRAPPER_FIELDS {
                match obj.get(*field) {
                    Some(Value::Object(map)) if *field == "rates" && !is_record(map) => {
                        return rate_map(map).map(Some);
                    }
                    Some(inner @ (Value::Array(_) | Value::Object(_))) => {
                        return table_from_value(inner, default_key);
                    }
                    _ => {}
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn is_record(obj: &Map<String, Value>) -> bool {
    PRICE_FIELDS.iter().any(|f| obj.contains_key(*f))
}

fn build_table(records: &[&Map<String, Value>], default_key: &RateKey) -> FeedResult<RateTable> {
    if records.is_empty() {
        return Err(FeedError::Malformed("empty rate table".into()));
    }

    // Duplicate keys: the most recent record wins, later records win ties
    let mut entries: BTreeMap<RateKey, (Decimal, Option<DateTime<Utc>>)> = BTreeMap::new();
    let mut source_time: Option<DateTime<Utc>> = None;

    for record in records {
        let key = record_key(record).unwrap_or_else(|| default_key.clone());
        let price = PRICE_FIELDS
            .iter()
            .find_map(|f| record.get(*f))
            .and_then(decimal_from_json)
            .ok_or_else(|| FeedError::Malformed(format!("non-numeric price for {}", key)))?;
        let time = record_time(record);

        source_time = source_time.max(time);
        match entries.get(&key) {
            Some((_, existing)) if existing.is_some() && time < *existing => {}
            _ => {
                entries.insert(key, (price, time));
            }
        }
    }

    Ok(RateTable {
        rates: entries.into_iter().map(|(k, (p, _))| (k, p)).collect(),
        source_time,
    })
}

fn rate_map(map: &Map<String, Value>) -> FeedResult<RateTable> {
    if map.is_empty() {
        return Err(FeedError::Malformed("empty rate map".into()));
    }
    let rates = map
        .iter()
        .map(|(key, value)| {
            decimal_from_json(value)
                .map(|price| (RateKey::new(key), price))
                .ok_or_else(|| FeedError::Malformed(format!("non-numeric price for {}", key)))
        })
        .collect::<FeedResult<BTreeMap<_, _>>>()?;

    Ok(RateTable {
        rates,
        source_time: None,
    })
}

fn record_key(record: &Map<String, Value>) -> Option<RateKey> {
    KEY_FIELDS
        .iter()
        .find_map(|f| record.get(*f).and_then(rate_key_from_json))
}

fn record_time(record: &Map<String, Value>) -> Option<DateTime<Utc>> {
    TIME_FIELDS.iter().find_map(|f| match record.get(*f)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    })
}
