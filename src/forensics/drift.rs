//! Schema drift detection.
//!
//! Compares each payload's key set and per-key JSON types against the
//! fixed reference ticker schema. Drift is an anomaly, never an error:
//! mismatching events keep flowing through the pipeline and a compact
//! sample is appended to `drift_samples.jsonl`, rate-limited so a
//! persistently broken feed cannot turn the sampler into an I/O hose.
//! Opaque extra keys are permitted and ignored.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::model::JsonObject;

/// Expected JSON type of a required key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Num,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Num => value.is_number(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Num => "number",
        }
    }
}

/// The 17 required ticker keys and their types.
pub const REFERENCE_SCHEMA: &[(&str, FieldKind)] = &[
    ("type", FieldKind::Str),
    ("sequence", FieldKind::Num),
    ("product_id", FieldKind::Str),
    ("price", FieldKind::Str),
    ("open_24h", FieldKind::Str),
    ("volume_24h", FieldKind::Str),
    ("low_24h", FieldKind::Str),
    ("high_24h", FieldKind::Str),
    ("volume_30d", FieldKind::Str),
    ("best_bid", FieldKind::Str),
    ("best_bid_size", FieldKind::Str),
    ("best_ask", FieldKind::Str),
    ("best_ask_size", FieldKind::Str),
    ("side", FieldKind::Str),
    ("time", FieldKind::Str),
    ("trade_id", FieldKind::Num),
    ("last_size", FieldKind::Str),
];

/// Check a payload against the reference schema. `Err` carries the first
/// mismatch as a human-readable reason.
pub fn check(raw: &JsonObject) -> Result<(), String> {
    for (key, kind) in REFERENCE_SCHEMA {
        match raw.get(*key) {
            None => return Err(format!("missing key: {}", key)),
            Some(value) if !kind.matches(value) => {
                return Err(format!("wrong type for {}: expected {}", key, kind.name()));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Minimum spacing between sample writes.
pub const SAMPLE_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Append-only, rate-limited drift sample writer.
#[derive(Debug)]
pub struct DriftSampler {
    path: PathBuf,
    last_write: Option<Instant>,
    written: u64,
    suppressed: u64,
}

impl DriftSampler {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_write: None,
            written: 0,
            suppressed: 0,
        }
    }

    /// Record one drift sample. Returns `true` when a line was written,
    /// `false` when the rate limit suppressed it.
    pub fn record(&mut self, reason: &str, raw: &JsonObject) -> bool {
        if let Some(last) = self.last_write {
            if last.elapsed() < SAMPLE_MIN_INTERVAL {
                self.suppressed += 1;
                return false;
            }
        }
        self.last_write = Some(Instant::now());

        let line = json!({
            "ts": Utc::now().timestamp_millis(),
            "reason": reason,
            "raw": Value::Object(raw.clone()),
        });

        if let Err(e) = self.append_line(&line) {
            warn!(path = %self.path.display(), error = %e, "drift sample write failed");
            return false;
        }
        self.written += 1;
        true
    }

    fn append_line(&self, line: &Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // whole-line write so concurrent readers never see a torn sample
        let mut buf = serde_json::to_vec(line)?;
        buf.push(b'\n');
        file.write_all(&buf)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_raw() -> JsonObject {
        match json!({
            "type": "ticker",
            "sequence": 1,
            "product_id": "BTC-USD",
            "price": "100.0",
            "open_24h": "99.0",
            "volume_24h": "1.0",
            "low_24h": "98.0",
            "high_24h": "101.0",
            "volume_30d": "30.0",
            "best_bid": "99.9",
            "best_bid_size": "1.0",
            "best_ask": "100.1",
            "best_ask_size": "1.0",
            "side": "sell",
            "time": "2024-03-01T00:00:00Z",
            "trade_id": 5,
            "last_size": "0.1",
        }) {
            Value::Object(obj) => obj,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_reference_schema_has_17_keys() {
        assert_eq!(REFERENCE_SCHEMA.len(), 17);
    }

    #[test]
    fn test_valid_payload_passes() {
        assert!(check(&valid_raw()).is_ok());
    }

    #[test]
    fn test_extra_keys_are_not_drift() {
        let mut raw = valid_raw();
        raw.insert("ingest_ts_ms".into(), json!(1234));
        raw.insert("venue_specific".into(), json!({"a": 1}));
        assert!(check(&raw).is_ok());
    }

    #[test]
    fn test_missing_key_is_drift() {
        let mut raw = valid_raw();
        raw.remove("price");
        assert_eq!(check(&raw).unwrap_err(), "missing key: price");
    }

    #[test]
    fn test_wrong_type_is_drift() {
        let mut raw = valid_raw();
        raw.insert("price".into(), json!(100.0));
        assert!(check(&raw).unwrap_err().contains("wrong type for price"));
    }

    #[test]
    fn test_sampler_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift_samples.jsonl");
        let mut sampler = DriftSampler::new(path.clone());

        let raw = valid_raw();
        let mut written = 0;
        for _ in 0..50 {
            if sampler.record("missing key: price", &raw) {
                written += 1;
            }
        }

        // back-to-back records land within the 100ms window
        assert_eq!(written, 1);
        assert_eq!(sampler.suppressed(), 49);

        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let sample: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(sample["reason"], "missing key: price");
        assert!(sample["raw"].is_object());
        assert!(sample["ts"].is_i64());
    }
}
