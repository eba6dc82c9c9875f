//! Health Consumer
//!
//! Periodic operator-facing view of pipeline health: events per second
//! seen on its own subscription, per-subscriber queue depths, and total
//! backpressure drops. A lagging consumer shows up here as a non-zero
//! drop count long before anyone reads the metrics endpoint.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::bus::{Bus, Subscription};

pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);

pub struct HealthConsumer {
    bus: Bus,
    events: u64,
    last_report: Instant,
    last_events: u64,
}

impl HealthConsumer {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            events: 0,
            last_report: Instant::now(),
            last_events: 0,
        }
    }

    pub async fn run(mut self, sub: Subscription) {
        info!("health consumer started");
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = sub.recv() => {
                    if event.is_none() {
                        break;
                    }
                    self.events += 1;
                }
                _ = ticker.tick() => {
                    self.report();
                }
            }
        }
        info!(events = self.events, "health consumer stopped");
    }

    fn report(&mut self) {
        let elapsed = self.last_report.elapsed().as_secs_f64();
        let eps = if elapsed > 0.0 {
            (self.events - self.last_events) as f64 / elapsed
        } else {
            0.0
        };
        self.last_report = Instant::now();
        self.last_events = self.events;

        let depths = self.bus.depths();
        let queues: Vec<String> = depths
            .iter()
            .map(|(name, depth, dropped)| format!("{}={}(-{})", name, depth, dropped))
            .collect();
        let drops_total: u64 = depths.iter().map(|(_, _, d)| d).sum();

        if drops_total > 0 {
            warn!(
                eps = %format!("{:.1}", eps),
                queues = %queues.join(" "),
                drops_total,
                "pipeline health: consumers lagging"
            );
        } else {
            info!(
                eps = %format!("{:.1}", eps),
                queues = %queues.join(" "),
                "pipeline health"
            );
        }
    }
}
