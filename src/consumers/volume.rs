//! Volume Consumer
//!
//! Per-minute USD notional and trade counts per symbol, keyed by the
//! event's receive stamp. Buckets are logged when the minute rolls over.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::bus::Subscription;
use crate::model::TickEvent;

#[derive(Debug, Default, Clone, Copy)]
struct MinuteBucket {
    usd: f64,
    trades: u64,
}

#[derive(Debug, Default)]
struct SymbolVolume {
    minute: i64,
    current: MinuteBucket,
}

pub struct VolumeConsumer {
    symbols: HashMap<String, SymbolVolume>,
    events: u64,
}

impl VolumeConsumer {
    pub fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            events: 0,
        }
    }

    pub async fn run(mut self, sub: Subscription) {
        info!("volume consumer started");
        while let Some(event) = sub.recv().await {
            self.apply(&event);
        }
        info!(events = self.events, "volume consumer stopped");
    }

    pub fn apply(&mut self, event: &Arc<TickEvent>) {
        self.events += 1;
        let (Some(price), Some(size)) = (event.price_f64(), event.size_f64()) else {
            return;
        };

        let minute = event.recv_ts_ms / 60_000;
        let symbol = event.symbol();
        let entry = self.symbols.entry(symbol.to_string()).or_default();

        if entry.minute != minute && entry.current.trades > 0 {
            info!(
                symbol,
                minute = entry.minute,
                usd = %format!("{:.2}", entry.current.usd),
                trades = entry.current.trades,
                "minute volume"
            );
            entry.current = MinuteBucket::default();
        }
        entry.minute = minute;
        entry.current.usd += price * size;
        entry.current.trades += 1;
    }

    pub fn current(&self, symbol: &str) -> Option<(f64, u64)> {
        self.symbols
            .get(symbol)
            .map(|v| (v.current.usd, v.current.trades))
    }
}

impl Default for VolumeConsumer {
    fn default() -> Self {
        Self::new()
    }
}
