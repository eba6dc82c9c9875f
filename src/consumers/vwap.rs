//! VWAP Consumer
//!
//! Per-symbol volume-weighted average price over the life of the stream,
//! plus the two pipeline latency views: `age` (recv - ingest, how stale
//! the exchange data was on arrival) and `proc` (now - recv, how far this
//! consumer runs behind the decode loop).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::bus::Subscription;
use crate::forensics::latency::{LatencyTracker, DEFAULT_WINDOW};
use crate::metrics;
use crate::model::TickEvent;

pub const DEFAULT_LOG_INTERVAL: u64 = 1000;

#[derive(Debug, Default)]
struct SymbolVwap {
    price_volume_sum: f64,
    volume_sum: f64,
    trades: u64,
}

impl SymbolVwap {
    fn vwap(&self) -> Option<f64> {
        (self.volume_sum > 0.0).then(|| self.price_volume_sum / self.volume_sum)
    }
}

pub struct VwapConsumer {
    symbols: HashMap<String, SymbolVwap>,
    age: LatencyTracker,
    proc: LatencyTracker,
    log_interval: u64,
    events: u64,
}

impl VwapConsumer {
    pub fn new(log_interval: u64) -> Self {
        Self {
            symbols: HashMap::new(),
            age: LatencyTracker::new(DEFAULT_WINDOW),
            proc: LatencyTracker::new(DEFAULT_WINDOW),
            log_interval,
            events: 0,
        }
    }

    pub fn vwap(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(SymbolVwap::vwap)
    }

    pub async fn run(mut self, sub: Subscription) {
        info!(log_interval = self.log_interval, "vwap consumer started");
        while let Some(event) = sub.recv().await {
            self.apply(&event);
        }
        info!(events = self.events, "vwap consumer stopped");
    }

    pub fn apply(&mut self, event: &Arc<TickEvent>) {
        self.events += 1;

        if let (Some(price), Some(size)) = (event.price_f64(), event.size_f64()) {
            let entry = self.symbols.entry(event.symbol().to_string()).or_default();
            entry.price_volume_sum += price * size;
            entry.volume_sum += size;
            entry.trades += 1;
        }

        if let Some(age) = event.age_ms() {
            self.age.record(age);
            metrics::global().latency_age_ms.record(age.max(0) as u64);
        }
        let proc = Utc::now().timestamp_millis() - event.recv_ts_ms;
        self.proc.record(proc);

        if self.events % self.log_interval == 0 {
            self.log_summary();
        }
    }

    fn log_summary(&self) {
        let mut vwaps: Vec<String> = self
            .symbols
            .iter()
            .filter_map(|(sym, v)| v.vwap().map(|w| format!("{}={:.2}", sym, w)))
            .collect();
        vwaps.sort();

        info!(
            events = self.events,
            vwap = %vwaps.join(" "),
            age_p50_ms = self.age.p50().unwrap_or(0),
            age_p95_ms = self.age.p95().unwrap_or(0),
            age_p99_ms = self.age.p99().unwrap_or(0),
            proc_p50_ms = self.proc.p50().unwrap_or(0),
            proc_p95_ms = self.proc.p95().unwrap_or(0),
            proc_p99_ms = self.proc.p99().unwrap_or(0),
            "vwap summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JsonObject;
    use serde_json::json;

    fn trade(symbol: &str, price: &str, size: &str) -> Arc<TickEvent> {
        let mut raw = JsonObject::new();
        raw.insert("product_id".into(), symbol.into());
        raw.insert("price".into(), price.into());
        raw.insert("last_size".into(), size.into());
        raw.insert("ingest_ts_ms".into(), json!(0));
        Arc::new(TickEvent::from_json(raw, 5))
    }

    #[test]
    fn test_vwap_is_volume_weighted() {
        let mut consumer = VwapConsumer::new(DEFAULT_LOG_INTERVAL);
        consumer.apply(&trade("BTC-USD", "100.0", "1.0"));
        consumer.apply(&trade("BTC-USD", "200.0", "3.0"));

        // (100*1 + 200*3) / 4 = 175
        assert!((consumer.vwap("BTC-USD").unwrap() - 175.0).abs() < 1e-9);
    }

    #[test]
    fn test_symbols_tracked_independently() {
        let mut consumer = VwapConsumer::new(DEFAULT_LOG_INTERVAL);
        consumer.apply(&trade("BTC-USD", "100.0", "1.0"));
        consumer.apply(&trade("ETH-USD", "10.0", "2.0"));

        assert!((consumer.vwap("BTC-USD").unwrap() - 100.0).abs() < 1e-9);
        assert!((consumer.vwap("ETH-USD").unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_unpriced_event_is_ignored() {
        let mut consumer = VwapConsumer::new(DEFAULT_LOG_INTERVAL);
        let mut raw = JsonObject::new();
        raw.insert("product_id".into(), "BTC-USD".into());
        consumer.apply(&Arc::new(TickEvent::from_json(raw, 5)));

        assert!(consumer.vwap("BTC-USD").is_none());
    }
}
