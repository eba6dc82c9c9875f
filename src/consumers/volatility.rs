//! Volatility Consumer
//!
//! Rolling standard deviation of log-returns per symbol. A proxy for how
//! jumpy a feed is; forensics catches broken feeds, this catches wild ones.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::info;

use crate::bus::Subscription;
use crate::model::TickEvent;

/// Log-returns kept per symbol.
pub const RETURN_WINDOW: usize = 256;

#[derive(Debug, Default)]
struct SymbolVol {
    last_price: Option<f64>,
    returns: VecDeque<f64>,
}

impl SymbolVol {
    fn push_price(&mut self, price: f64) {
        if let Some(last) = self.last_price {
            if last > 0.0 && price > 0.0 {
                if self.returns.len() == RETURN_WINDOW {
                    self.returns.pop_front();
                }
                self.returns.push_back((price / last).ln());
            }
        }
        self.last_price = Some(price);
    }

    fn stddev(&self) -> Option<f64> {
        if self.returns.len() < 2 {
            return None;
        }
        let n = self.returns.len() as f64;
        let mean = self.returns.iter().sum::<f64>() / n;
        let variance = self
            .returns
            .iter()
            .map(|r| {
                let d = r - mean;
                d * d
            })
            .sum::<f64>()
            / (n - 1.0);
        Some(variance.sqrt())
    }
}

pub struct VolatilityConsumer {
    symbols: HashMap<String, SymbolVol>,
    log_interval: u64,
    events: u64,
}

impl VolatilityConsumer {
    pub fn new(log_interval: u64) -> Self {
        Self {
            symbols: HashMap::new(),
            log_interval,
            events: 0,
        }
    }

    pub fn stddev(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(SymbolVol::stddev)
    }

    pub async fn run(mut self, sub: Subscription) {
        info!("volatility consumer started");
        while let Some(event) = sub.recv().await {
            self.apply(&event);
        }
        info!(events = self.events, "volatility consumer stopped");
    }

    pub fn apply(&mut self, event: &Arc<TickEvent>) {
        self.events += 1;
        if let Some(price) = event.price_f64() {
            self.symbols
                .entry(event.symbol().to_string())
                .or_default()
                .push_price(price);
        }

        if self.events % self.log_interval == 0 {
            let mut vols: Vec<String> = self
                .symbols
                .iter()
                .filter_map(|(sym, v)| v.stddev().map(|s| format!("{}={:.6}", sym, s)))
                .collect();
            vols.sort();
            info!(events = self.events, stddev = %vols.join(" "), "volatility summary");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JsonObject;

    fn trade(price: &str) -> Arc<TickEvent> {
        let mut raw = JsonObject::new();
        raw.insert("product_id".into(), "BTC-USD".into());
        raw.insert("price".into(), price.into());
        Arc::new(TickEvent::from_json(raw, 0))
    }

    #[test]
    fn test_constant_price_has_zero_volatility() {
        let mut consumer = VolatilityConsumer::new(1000);
        for _ in 0..10 {
            consumer.apply(&trade("100.0"));
        }
        assert!(consumer.stddev("BTC-USD").unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_alternating_prices_have_positive_volatility() {
        let mut consumer = VolatilityConsumer::new(1000);
        for i in 0..20 {
            consumer.apply(&trade(if i % 2 == 0 { "100.0" } else { "110.0" }));
        }
        assert!(consumer.stddev("BTC-USD").unwrap() > 0.01);
    }

    #[test]
    fn test_needs_two_returns() {
        let mut consumer = VolatilityConsumer::new(1000);
        consumer.apply(&trade("100.0"));
        consumer.apply(&trade("101.0"));
        assert!(consumer.stddev("BTC-USD").is_none());
    }
}
