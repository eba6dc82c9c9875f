//! Event Records
//!
//! One decoded trade tick. The processor keeps the original JSON object
//! (key order preserved) alongside a typed view: payloads that fail schema
//! checks still flow through the pipeline as drift anomalies rather than
//! errors, so every typed field a bad payload may omit is optional. An
//! event is immutable once decoded and travels the bus as `Arc<TickEvent>`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub type JsonObject = Map<String, Value>;

/// Trade aggressor side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Typed view over a tick payload.
///
/// `price` and `last_size` stay decimal strings; consumers parse to f64
/// only for arithmetic, never for equality.
#[derive(Debug, Clone, Default)]
pub struct Ticker {
    pub product_id: Option<String>,
    pub trade_id: Option<u64>,
    pub sequence: Option<u64>,
    pub price: Option<String>,
    pub last_size: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub side: Option<Side>,
    pub ingest_ts_ms: Option<i64>,
}

impl Ticker {
    pub fn from_raw(raw: &JsonObject) -> Self {
        Self {
            product_id: str_field(raw, "product_id"),
            trade_id: u64_field(raw, "trade_id"),
            sequence: u64_field(raw, "sequence"),
            price: str_field(raw, "price"),
            last_size: str_field(raw, "last_size"),
            time: raw
                .get("time")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            side: raw
                .get("side")
                .and_then(Value::as_str)
                .and_then(Side::parse),
            ingest_ts_ms: raw.get("ingest_ts_ms").and_then(Value::as_i64),
        }
    }
}

/// One event in flight: the raw payload plus the processor receive stamp.
#[derive(Debug, Clone)]
pub struct TickEvent {
    /// Decoded payload, original key order, opaque fields included
    pub raw: JsonObject,
    /// Typed view extracted from `raw` at decode time
    pub ticker: Ticker,
    /// Wall-clock ms stamped immediately after frame decode
    pub recv_ts_ms: i64,
}

impl TickEvent {
    pub fn from_json(raw: JsonObject, recv_ts_ms: i64) -> Self {
        let ticker = Ticker::from_raw(&raw);
        Self {
            raw,
            ticker,
            recv_ts_ms,
        }
    }

    /// Pipeline latency in ms (`recv_ts_ms - ingest_ts_ms`), when the
    /// ingest stamp is present. May be negative under clock skew.
    pub fn age_ms(&self) -> Option<i64> {
        self.ticker.ingest_ts_ms.map(|t| self.recv_ts_ms - t)
    }

    pub fn symbol(&self) -> &str {
        self.ticker.product_id.as_deref().unwrap_or("UNKNOWN")
    }

    pub fn price_f64(&self) -> Option<f64> {
        self.ticker.price.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn size_f64(&self) -> Option<f64> {
        self.ticker.last_size.as_deref().and_then(|s| s.parse().ok())
    }

    /// Serialize for `events.jsonl` and the raw recorder: the original
    /// object with `recv_ts_ms` appended, key order preserved.
    pub fn to_jsonl_value(&self) -> Value {
        let mut obj = self.raw.clone();
        obj.insert("recv_ts_ms".to_string(), self.recv_ts_ms.into());
        Value::Object(obj)
    }
}

fn str_field(raw: &JsonObject, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_string)
}

fn u64_field(raw: &JsonObject, key: &str) -> Option<u64> {
    match raw.get(key)? {
        Value::Number(n) => n.as_u64(),
        // Some exchanges quote numeric ids
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
