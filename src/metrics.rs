//! Pipeline Metrics
//!
//! Process-global registry of counters, gauges, and the age-latency
//! histogram, exported in Prometheus text format on the metrics port.
//! Hot-path updates are lock-free atomic increments; the per-subscriber
//! depth gauges are refreshed by the periodic flush task, off the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{routing::get, Json, Router};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::Bus;

lazy_static! {
    static ref GLOBAL: PipelineMetrics = PipelineMetrics::new();
}

/// The process-global registry.
pub fn global() -> &'static PipelineMetrics {
    &GLOBAL
}

/// Cumulative-bucket histogram in milliseconds.
pub struct LatencyHistogram {
    /// Bucket upper bounds in ms
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let buckets = vec![1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a latency observation in milliseconds.
    pub fn record(&self, value_ms: u64) {
        for (i, &boundary) in self.buckets.iter().enumerate() {
            if value_ms <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Export as Prometheus histogram lines.
    pub fn to_prometheus(&self, name: &str) -> String {
        let mut output = String::new();
        let mut cumulative = 0u64;

        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name, boundary, cumulative
            ));
        }

        let total = self.count.load(Ordering::Relaxed);
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, total));
        output.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.sum_ms.load(Ordering::Relaxed)
        ));
        output.push_str(&format!("{}_count {}\n", name, total));

        output
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// All counters and gauges the core updates.
pub struct PipelineMetrics {
    pub events_total: AtomicU64,
    /// f64 stored as bits
    events_per_second: AtomicU64,
    pub latency_age_ms: LatencyHistogram,
    pub drift_total: AtomicU64,
    pub dup_total: AtomicU64,
    pub ooo_total: AtomicU64,
    pub gaps_total: AtomicU64,
    pub spikes_total: AtomicU64,
    pub incidents_total: AtomicU64,
    pub incident_capture_failures: AtomicU64,
    pub drops_total: AtomicU64,
    queue_depth: RwLock<HashMap<String, u64>>,
}

impl PipelineMetrics {
    fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_per_second: AtomicU64::new(0f64.to_bits()),
            latency_age_ms: LatencyHistogram::new(),
            drift_total: AtomicU64::new(0),
            dup_total: AtomicU64::new(0),
            ooo_total: AtomicU64::new(0),
            gaps_total: AtomicU64::new(0),
            spikes_total: AtomicU64::new(0),
            incidents_total: AtomicU64::new(0),
            incident_capture_failures: AtomicU64::new(0),
            drops_total: AtomicU64::new(0),
            queue_depth: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_events_per_second(&self, eps: f64) {
        self.events_per_second.store(eps.to_bits(), Ordering::Relaxed);
    }

    pub fn events_per_second(&self) -> f64 {
        f64::from_bits(self.events_per_second.load(Ordering::Relaxed))
    }

    pub fn set_queue_depth(&self, sub: &str, depth: u64) {
        self.queue_depth.write().insert(sub.to_string(), depth);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_per_second: self.events_per_second(),
            drift: self.drift_total.load(Ordering::Relaxed),
            dup: self.dup_total.load(Ordering::Relaxed),
            ooo: self.ooo_total.load(Ordering::Relaxed),
            gaps: self.gaps_total.load(Ordering::Relaxed),
            spikes: self.spikes_total.load(Ordering::Relaxed),
            incidents_total: self.incidents_total.load(Ordering::Relaxed),
            incident_capture_failures: self.incident_capture_failures.load(Ordering::Relaxed),
            drops_total: self.drops_total.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.read().clone(),
        }
    }

    /// Export all metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP mercurystream_events_total Events published to the bus\n");
        output.push_str("# TYPE mercurystream_events_total counter\n");
        output.push_str(&format!(
            "mercurystream_events_total {}\n",
            self.events_total.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP mercurystream_events_per_second Recent publish rate\n");
        output.push_str("# TYPE mercurystream_events_per_second gauge\n");
        output.push_str(&format!(
            "mercurystream_events_per_second {:.2}\n",
            self.events_per_second()
        ));

        output.push_str("\n# HELP mercurystream_latency_ms Pipeline age latency (recv - ingest)\n");
        output.push_str("# TYPE mercurystream_latency_ms histogram\n");
        output.push_str(&self.latency_age_ms.to_prometheus("mercurystream_latency_ms"));

        output.push_str("\n# HELP mercurystream_anomalies_total Anomalies by detector\n");
        output.push_str("# TYPE mercurystream_anomalies_total counter\n");
        for (kind, counter) in [
            ("drift", &self.drift_total),
            ("dup", &self.dup_total),
            ("ooo", &self.ooo_total),
            ("gaps", &self.gaps_total),
            ("spikes", &self.spikes_total),
        ] {
            output.push_str(&format!(
                "mercurystream_anomalies_total{{type=\"{}\"}} {}\n",
                kind,
                counter.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP mercurystream_incidents_total Incident bundles written\n");
        output.push_str("# TYPE mercurystream_incidents_total counter\n");
        output.push_str(&format!(
            "mercurystream_incidents_total {}\n",
            self.incidents_total.load(Ordering::Relaxed)
        ));

        output.push_str(
            "\n# HELP mercurystream_incident_capture_failures_total Bundles abandoned on fs errors\n",
        );
        output.push_str("# TYPE mercurystream_incident_capture_failures_total counter\n");
        output.push_str(&format!(
            "mercurystream_incident_capture_failures_total {}\n",
            self.incident_capture_failures.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP mercurystream_drops_total Events evicted by backpressure\n");
        output.push_str("# TYPE mercurystream_drops_total counter\n");
        output.push_str(&format!(
            "mercurystream_drops_total {}\n",
            self.drops_total.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP mercurystream_queue_depth Per-subscriber queue depth\n");
        output.push_str("# TYPE mercurystream_queue_depth gauge\n");
        for (sub, depth) in self.queue_depth.read().iter() {
            output.push_str(&format!(
                "mercurystream_queue_depth{{sub=\"{}\"}} {}\n",
                sub, depth
            ));
        }

        output
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub events_total: u64,
    pub events_per_second: f64,
    pub drift: u64,
    pub dup: u64,
    pub ooo: u64,
    pub gaps: u64,
    pub spikes: u64,
    pub incidents_total: u64,
    pub incident_capture_failures: u64,
    pub drops_total: u64,
    pub queue_depth: HashMap<String, u64>,
}

/// Serve `/metrics` (Prometheus text) and `/healthz` (JSON snapshot).
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(|| async { global().to_prometheus() }))
        .route("/healthz", get(|| async { Json(global().snapshot()) }));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodic flush: recompute the publish-rate gauge and per-subscriber
/// queue depths from the bus, once a second, until shutdown.
pub async fn flush_loop(bus: Bus, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_total = global().events_total.load(Ordering::Relaxed);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let total = global().events_total.load(Ordering::Relaxed);
        global().set_events_per_second((total - last_total) as f64);
        last_total = total;

        for (name, depth, _dropped) in bus.depths() {
            global().set_queue_depth(&name, depth as u64);
        }
    }
}

/// Spawn the metrics endpoint, logging instead of tearing the process down
/// if the port is taken.
pub fn spawn_server(port: u16) {
    tokio::spawn(async move {
        if let Err(e) = serve(port).await {
            warn!("metrics server exited: {}", e);
        }
    });
}
