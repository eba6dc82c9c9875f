//! Forensics Engine
//!
//! Five data-quality detectors over the live stream: schema drift,
//! duplicate trades, out-of-order timestamps, sequence gaps, and latency
//! spikes. All detector state is owned by the single forensics task, so no
//! locking is needed; the counters are atomics only so other tasks can
//! snapshot them.
//!
//! Every event is fed to the flight recorder before detectors run, which
//! means the trigger event is always the last element of the pre-window.

pub mod drift;
pub mod latency;
pub mod lru;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::Subscription;
use crate::flight::{DetectorStats, FlightConfig, FlightRecorder, IncidentKind};
use crate::metrics;
use crate::model::TickEvent;
use drift::DriftSampler;
use latency::LatencyTracker;
use lru::LruSet;

pub const DEFAULT_LRU_MAX: usize = 50_000;
pub const DEFAULT_SPIKE_THRESHOLD_MS: i64 = 100;
/// Evaluate the p99 every this many age samples.
pub const SPIKE_EVAL_EVERY: u64 = 100;
/// Consecutive above-threshold evaluations required to trigger.
pub const SPIKE_CONSECUTIVE_EVALS: u32 = 2;

#[derive(Debug, Clone)]
pub struct ForensicsConfig {
    pub lru_max: usize,
    pub spike_threshold_ms: i64,
    pub latency_window: usize,
    pub drift_sample_path: PathBuf,
    pub flight: FlightConfig,
}

/// Counters shared read-only with the rest of the process.
#[derive(Debug, Default)]
pub struct ForensicsStats {
    pub processed: AtomicU64,
    pub drift: AtomicU64,
    pub dup: AtomicU64,
    pub ooo: AtomicU64,
    pub gaps: AtomicU64,
    pub spikes: AtomicU64,
    pub incidents: AtomicU64,
}

impl ForensicsStats {
    pub fn snapshot(&self) -> DetectorStats {
        DetectorStats {
            processed: self.processed.load(Ordering::Relaxed),
            drift: self.drift.load(Ordering::Relaxed),
            dup: self.dup.load(Ordering::Relaxed),
            ooo: self.ooo.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            spikes: self.spikes.load(Ordering::Relaxed),
            incidents: self.incidents.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct SymbolState {
    last_sequence: Option<u64>,
    last_time: Option<DateTime<Utc>>,
}

pub struct Forensics {
    config: ForensicsConfig,
    stats: Arc<ForensicsStats>,
    recorder: FlightRecorder,
    seen_trades: LruSet,
    symbols: HashMap<String, SymbolState>,
    ages: LatencyTracker,
    samples_since_eval: u64,
    evals_above: u32,
    sampler: DriftSampler,
}

impl Forensics {
    pub fn new(config: ForensicsConfig) -> Self {
        let recorder = FlightRecorder::new(config.flight.clone());
        let seen_trades = LruSet::new(config.lru_max);
        let ages = LatencyTracker::new(config.latency_window);
        let sampler = DriftSampler::new(config.drift_sample_path.clone());
        Self {
            config,
            stats: Arc::new(ForensicsStats::default()),
            recorder,
            seen_trades,
            symbols: HashMap::new(),
            ages,
            samples_since_eval: 0,
            evals_above: 0,
            sampler,
        }
    }

    pub fn stats(&self) -> Arc<ForensicsStats> {
        self.stats.clone()
    }

    pub fn incidents_written(&self) -> u64 {
        self.recorder.incidents_written()
    }

    /// Consume the subscription until the bus closes, then finalize any
    /// in-flight capture.
    pub async fn run(mut self, sub: Subscription) {
        info!(
            lru_max = self.config.lru_max,
            spike_threshold_ms = self.config.spike_threshold_ms,
            pre_events = self.config.flight.pre_events,
            post_events = self.config.flight.post_events,
            "forensics consumer started"
        );

        while let Some(event) = sub.recv().await {
            self.process(&event);
        }

        self.finish();
        let stats = self.stats.snapshot();
        info!(
            processed = stats.processed,
            drift = stats.drift,
            dup = stats.dup,
            ooo = stats.ooo,
            gaps = stats.gaps,
            spikes = stats.spikes,
            incidents = stats.incidents,
            "forensics consumer stopped"
        );
    }

    /// Run the ring feed and all five detectors on one event.
    pub fn process(&mut self, event: &Arc<TickEvent>) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.recorder.record(event, self.stats.snapshot());

        self.check_drift(event);
        self.check_duplicate(event);
        self.check_out_of_order(event);
        self.check_sequence_gap(event);
        self.check_latency_spike(event);

        self.stats
            .incidents
            .store(self.recorder.incidents_written(), Ordering::Relaxed);
    }

    /// Shutdown path: best-effort finalize of a partial capture.
    pub fn finish(&mut self) {
        self.recorder.finalize_partial(self.stats.snapshot());
        self.stats
            .incidents
            .store(self.recorder.incidents_written(), Ordering::Relaxed);
    }

    // D1: key set and per-key types vs the reference schema. Counted and
    // sampled, never an incident.
    fn check_drift(&mut self, event: &Arc<TickEvent>) {
        if let Err(reason) = drift::check(&event.raw) {
            self.stats.drift.fetch_add(1, Ordering::Relaxed);
            metrics::global().drift_total.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = event.symbol(), %reason, "schema drift");
            self.sampler.record(&reason, &event.raw);
        }
    }

    // D2: bounded LRU of seen trade_ids.
    fn check_duplicate(&mut self, event: &Arc<TickEvent>) {
        let Some(trade_id) = event.ticker.trade_id else {
            return;
        };
        if self.seen_trades.insert(trade_id) {
            self.stats.dup.fetch_add(1, Ordering::Relaxed);
            metrics::global().dup_total.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = event.symbol(), trade_id, "duplicate trade");

            let mut tagged = event.to_jsonl_value();
            if let Value::Object(obj) = &mut tagged {
                obj.insert("dup".to_string(), Value::Bool(true));
            }
            self.recorder
                .trigger(IncidentKind::DuplicateDetected, tagged, event.symbol());
        }
    }

    // D3: time moving backwards within a symbol. Counted only.
    fn check_out_of_order(&mut self, event: &Arc<TickEvent>) {
        let Some(time) = event.ticker.time else {
            return;
        };
        let state = self.symbols.entry(event.symbol().to_string()).or_default();
        if let Some(last) = state.last_time {
            if time < last {
                self.stats.ooo.fetch_add(1, Ordering::Relaxed);
                metrics::global().ooo_total.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = event.symbol(), "out-of-order timestamp");
            }
        }
        state.last_time = Some(time);
    }

    // D4: holes in the per-symbol sequence.
    fn check_sequence_gap(&mut self, event: &Arc<TickEvent>) {
        let Some(sequence) = event.ticker.sequence else {
            return;
        };
        let state = self.symbols.entry(event.symbol().to_string()).or_default();
        if let Some(last) = state.last_sequence {
            if sequence > last + 1 {
                let missing = sequence - last - 1;
                self.stats.gaps.fetch_add(missing, Ordering::Relaxed);
                metrics::global().gaps_total.fetch_add(missing, Ordering::Relaxed);
                warn!(
                    symbol = event.symbol(),
                    last, sequence, missing, "sequence gap"
                );
                self.recorder.trigger(
                    IncidentKind::SequenceGap,
                    event.to_jsonl_value(),
                    event.symbol(),
                );
            }
        }
        state.last_sequence = Some(sequence);
    }

    // D5: p99 of the age window, evaluated every SPIKE_EVAL_EVERY samples;
    // two consecutive evaluations above threshold trigger.
    fn check_latency_spike(&mut self, event: &Arc<TickEvent>) {
        let Some(age) = event.age_ms() else {
            return;
        };
        self.ages.record(age);
        self.samples_since_eval += 1;
        if self.samples_since_eval < SPIKE_EVAL_EVERY {
            return;
        }
        self.samples_since_eval = 0;

        let Some(p99) = self.ages.p99() else {
            return;
        };
        if p99 > self.config.spike_threshold_ms {
            self.evals_above += 1;
            if self.evals_above >= SPIKE_CONSECUTIVE_EVALS {
                self.evals_above = 0;
                self.stats.spikes.fetch_add(1, Ordering::Relaxed);
                metrics::global().spikes_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = event.symbol(),
                    p99_ms = p99,
                    threshold_ms = self.config.spike_threshold_ms,
                    "latency spike"
                );
                self.recorder.trigger(
                    IncidentKind::LatencySpike,
                    event.to_jsonl_value(),
                    event.symbol(),
                );
            }
        } else {
            self.evals_above = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn config(dir: &std::path::Path, post: usize, cooldown: Duration) -> ForensicsConfig {
        ForensicsConfig {
            lru_max: 1000,
            spike_threshold_ms: 100,
            latency_window: 1000,
            drift_sample_path: dir.join("drift_samples.jsonl"),
            flight: FlightConfig {
                pre_events: 100,
                post_events: post,
                cooldown,
                incidents_root: dir.join("incidents"),
            },
        }
    }

    fn event(trade_id: u64, sequence: u64, time: &str) -> Arc<TickEvent> {
        let raw = match json!({
            "type": "ticker",
            "sequence": sequence,
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
            "side": "buy",
            "time": time,
            "trade_id": trade_id,
            "last_size": "0.1",
            "ingest_ts_ms": 0,
        }) {
            Value::Object(obj) => obj,
            _ => unreachable!(),
        };
        Arc::new(TickEvent::from_json(raw, 10))
    }

    fn aged_event(trade_id: u64, age_ms: i64) -> Arc<TickEvent> {
        let raw = match json!({
            "type": "ticker",
            "sequence": trade_id,
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
            "side": "buy",
            "time": "2024-03-01T00:00:00Z",
            "trade_id": trade_id,
            "last_size": "0.1",
            "ingest_ts_ms": 0,
        }) {
            Value::Object(obj) => obj,
            _ => unreachable!(),
        };
        Arc::new(TickEvent::from_json(raw, age_ms))
    }

    fn incident_dirs(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut dirs: Vec<_> = std::fs::read_dir(dir.join("incidents"))
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        dirs.sort();
        dirs
    }

    fn meta_of(dir: &std::path::Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(dir.join("meta.json")).unwrap()).unwrap()
    }

    #[test]
    fn test_duplicate_triggers_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(config(dir.path(), 2, Duration::from_secs(60)));

        for id in 1..=100 {
            forensics.process(&event(id, id, "2024-03-01T00:00:00Z"));
        }
        forensics.process(&event(50, 101, "2024-03-01T00:00:01Z"));
        // post-window fill
        forensics.process(&event(101, 102, "2024-03-01T00:00:02Z"));
        forensics.process(&event(102, 103, "2024-03-01T00:00:03Z"));

        let stats = forensics.stats.snapshot();
        assert_eq!(stats.dup, 1);
        assert_eq!(stats.incidents, 1);

        let dirs = incident_dirs(dir.path());
        assert_eq!(dirs.len(), 1);
        let meta = meta_of(&dirs[0]);
        assert_eq!(meta["type"], "duplicate_detected");
        assert_eq!(meta["trigger_event"]["dup"], true);
        assert_eq!(meta["symbol"], "BTC-USD");
    }

    #[test]
    fn test_sequence_gap_arithmetic() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(config(dir.path(), 1, Duration::from_secs(60)));

        for (id, seq) in [(1, 100u64), (2, 101), (3, 102), (4, 106), (5, 107)] {
            forensics.process(&event(id, seq, "2024-03-01T00:00:00Z"));
        }

        let stats = forensics.stats.snapshot();
        assert_eq!(stats.gaps, 3);
        assert_eq!(stats.incidents, 1);
        let dirs = incident_dirs(dir.path());
        assert_eq!(meta_of(&dirs[0])["type"], "sequence_gap");
    }

    #[test]
    fn test_out_of_order_counts_without_incident() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(config(dir.path(), 1, Duration::from_secs(60)));

        forensics.process(&event(1, 1, "2024-03-01T00:00:05Z"));
        forensics.process(&event(2, 2, "2024-03-01T00:00:01Z"));
        forensics.process(&event(3, 3, "2024-03-01T00:00:02Z"));

        let stats = forensics.stats.snapshot();
        assert_eq!(stats.ooo, 1);
        assert_eq!(stats.incidents, 0);
    }

    #[test]
    fn test_latency_spike_needs_two_consecutive_evaluations() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(config(dir.path(), 5, Duration::from_secs(60)));

        let mut id = 0u64;
        for _ in 0..200 {
            id += 1;
            forensics.process(&aged_event(id, 10));
        }
        assert_eq!(forensics.stats.snapshot().spikes, 0);

        // evaluation at sample 300 crosses but must not trigger yet
        for _ in 0..100 {
            id += 1;
            forensics.process(&aged_event(id, 500));
        }
        assert_eq!(forensics.stats.snapshot().spikes, 0);

        // second consecutive evaluation above threshold triggers once
        for _ in 0..100 {
            id += 1;
            forensics.process(&aged_event(id, 500));
        }
        assert_eq!(forensics.stats.snapshot().spikes, 1);

        // fill the post-window so the bundle commits
        for _ in 0..5 {
            id += 1;
            forensics.process(&aged_event(id, 500));
        }
        let stats = forensics.stats.snapshot();
        assert_eq!(stats.spikes, 1);
        assert_eq!(stats.incidents, 1);
        let dirs = incident_dirs(dir.path());
        assert_eq!(meta_of(&dirs[0])["type"], "latency_spike");
    }

    #[test]
    fn test_cooldown_collapses_nearby_incidents() {
        let dir = tempfile::tempdir().unwrap();
        let cooldown = Duration::from_millis(80);
        let mut forensics = Forensics::new(config(dir.path(), 1, cooldown));

        for id in 1..=10 {
            forensics.process(&event(id, id, "2024-03-01T00:00:00Z"));
        }

        // first duplicate: captures and finalizes (post = 1)
        forensics.process(&event(5, 11, "2024-03-01T00:00:01Z"));
        forensics.process(&event(11, 12, "2024-03-01T00:00:02Z"));
        // second duplicate lands inside the cooldown window
        forensics.process(&event(6, 13, "2024-03-01T00:00:03Z"));
        forensics.process(&event(12, 14, "2024-03-01T00:00:04Z"));
        assert_eq!(forensics.stats.snapshot().dup, 2);
        assert_eq!(forensics.stats.snapshot().incidents, 1);

        // past the cooldown the next duplicate captures again
        std::thread::sleep(cooldown + Duration::from_millis(20));
        forensics.process(&event(7, 15, "2024-03-01T00:00:05Z"));
        forensics.process(&event(13, 16, "2024-03-01T00:00:06Z"));
        assert_eq!(forensics.stats.snapshot().incidents, 2);
    }

    #[test]
    fn test_drift_counts_without_incident() {
        let dir = tempfile::tempdir().unwrap();
        let mut forensics = Forensics::new(config(dir.path(), 1, Duration::from_secs(60)));

        for id in 1..=50 {
            let ev = event(id, id, "2024-03-01T00:00:00Z");
            let mut raw = ev.raw.clone();
            raw.remove("price");
            forensics.process(&Arc::new(TickEvent::from_json(raw, 10)));
        }

        let stats = forensics.stats.snapshot();
        assert_eq!(stats.drift, 50);
        assert_eq!(stats.incidents, 0);

        let samples = std::fs::read_to_string(dir.path().join("drift_samples.jsonl")).unwrap();
        let lines = samples.lines().count();
        assert!((1..=50).contains(&lines), "rate limit bounds: {}", lines);
    }

    #[test]
    fn test_trade_ids_outside_lru_window_are_missed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 1, Duration::from_secs(60));
        cfg.lru_max = 10;
        let mut forensics = Forensics::new(cfg);

        for id in 1..=30 {
            forensics.process(&event(id, id, "2024-03-01T00:00:00Z"));
        }
        // trade 1 was evicted long ago; the bounded set cannot flag it
        forensics.process(&event(1, 31, "2024-03-01T00:00:01Z"));
        assert_eq!(forensics.stats.snapshot().dup, 0);
    }
}
