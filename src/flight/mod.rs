//! Flight Recorder
//!
//! Ring buffer of recent events plus the incident capture state machine.
//! A trigger snapshots the ring into a pre-window, collects a post-window
//! from subsequent events, and commits a self-contained bundle directory
//! to disk; triggers during capture or cooldown are ignored.
//!
//! Bundle commit is atomic: everything is written under a `.tmp`-suffixed
//! directory (`meta.json` last) and renamed into place, so the final
//! directory name is the commit point.

pub mod ring;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::metrics;
use crate::model::TickEvent;
use ring::RingBuffer;

pub const DEFAULT_PRE_EVENTS: usize = 5000;
pub const DEFAULT_POST_EVENTS: usize = 3000;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// What fired the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentKind {
    DuplicateDetected,
    SequenceGap,
    LatencySpike,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateDetected => "duplicate_detected",
            Self::SequenceGap => "sequence_gap",
            Self::LatencySpike => "latency_spike",
        }
    }
}

/// Detector counter snapshot embedded in `meta.json`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DetectorStats {
    pub processed: u64,
    pub drift: u64,
    pub dup: u64,
    pub ooo: u64,
    pub gaps: u64,
    pub spikes: u64,
    pub incidents: u64,
}

#[derive(Debug, Clone)]
pub struct FlightConfig {
    pub pre_events: usize,
    pub post_events: usize,
    pub cooldown: Duration,
    pub incidents_root: PathBuf,
}

impl FlightConfig {
    pub fn new(incidents_root: PathBuf) -> Self {
        Self {
            pre_events: DEFAULT_PRE_EVENTS,
            post_events: DEFAULT_POST_EVENTS,
            cooldown: DEFAULT_COOLDOWN,
            incidents_root,
        }
    }
}

struct ActiveCapture {
    kind: IncidentKind,
    triggered_at: DateTime<Utc>,
    trigger_event: Value,
    symbol: String,
    pre: Vec<Arc<TickEvent>>,
    post: Vec<Arc<TickEvent>>,
}

enum CaptureState {
    Idle,
    Capturing(Box<ActiveCapture>),
    Cooldown { since: Instant },
}

pub struct FlightRecorder {
    config: FlightConfig,
    ring: RingBuffer<Arc<TickEvent>>,
    state: CaptureState,
    incidents_written: u64,
}

impl FlightRecorder {
    pub fn new(config: FlightConfig) -> Self {
        let ring = RingBuffer::new(config.pre_events);
        Self {
            config,
            ring,
            state: CaptureState::Idle,
            incidents_written: 0,
        }
    }

    /// Feed one event, before any detector runs on it. Advances an active
    /// capture and expires cooldown.
    pub fn record(&mut self, event: &Arc<TickEvent>, stats: DetectorStats) {
        self.ring.push(event.clone());

        match &mut self.state {
            CaptureState::Idle => return,
            CaptureState::Capturing(capture) => {
                capture.post.push(event.clone());
                if capture.post.len() < self.config.post_events {
                    return;
                }
            }
            CaptureState::Cooldown { since } => {
                if since.elapsed() >= self.config.cooldown {
                    self.state = CaptureState::Idle;
                }
                return;
            }
        }
        // post-window full
        self.finalize(stats);
    }

    /// Start a capture. Ignored while one is already in flight or cooling
    /// down; cooldown expiry happens in [`record`], which always precedes
    /// the trigger for the same event.
    pub fn trigger(&mut self, kind: IncidentKind, trigger_event: Value, symbol: &str) {
        if !matches!(self.state, CaptureState::Idle) {
            return;
        }

        let pre = self.ring.snapshot();
        info!(
            kind = kind.as_str(),
            symbol,
            pre_count = pre.len(),
            "incident capture started"
        );
        self.state = CaptureState::Capturing(Box::new(ActiveCapture {
            kind,
            triggered_at: Utc::now(),
            trigger_event,
            symbol: symbol.to_string(),
            pre,
            post: Vec::with_capacity(self.config.post_events),
        }));
    }

    /// Best-effort finalize of an in-flight capture at shutdown;
    /// `post_count` reflects whatever was collected.
    pub fn finalize_partial(&mut self, stats: DetectorStats) {
        if matches!(self.state, CaptureState::Capturing(_)) {
            self.finalize(stats);
        }
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, CaptureState::Capturing(_))
    }

    pub fn incidents_written(&self) -> u64 {
        self.incidents_written
    }

    fn finalize(&mut self, mut stats: DetectorStats) {
        let state = std::mem::replace(&mut self.state, CaptureState::Cooldown { since: Instant::now() });
        let capture = match state {
            CaptureState::Capturing(capture) => capture,
            // finalize is only reachable from Capturing
            _ => return,
        };

        stats.incidents = self.incidents_written + 1;
        match self.write_bundle(&capture, stats) {
            Ok(path) => {
                self.incidents_written += 1;
                metrics::global()
                    .incidents_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(
                    kind = capture.kind.as_str(),
                    symbol = %capture.symbol,
                    pre_count = capture.pre.len(),
                    post_count = capture.post.len(),
                    path = %path.display(),
                    "incident bundle written"
                );
            }
            Err(e) => {
                metrics::global()
                    .incident_capture_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(
                    kind = capture.kind.as_str(),
                    error = %e,
                    "incident bundle abandoned"
                );
            }
        }
    }

    fn write_bundle(&self, capture: &ActiveCapture, stats: DetectorStats) -> std::io::Result<PathBuf> {
        let name = format!(
            "{}_{}",
            capture.triggered_at.format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let final_dir = self.config.incidents_root.join(&name);
        let tmp_dir = self.config.incidents_root.join(format!("{}.tmp", name));

        let result: std::io::Result<PathBuf> = (|| {
            fs::create_dir_all(&tmp_dir)?;

            let file = File::create(tmp_dir.join("events.jsonl"))?;
            let mut writer = BufWriter::new(file);
            for event in capture.pre.iter().chain(capture.post.iter()) {
                serde_json::to_writer(&mut writer, &event.to_jsonl_value())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;

            let meta = json!({
                "type": capture.kind.as_str(),
                "triggered_at": capture.triggered_at.to_rfc3339(),
                "trigger_event": capture.trigger_event.clone(),
                "pre_count": capture.pre.len(),
                "post_count": capture.post.len(),
                "symbol": capture.symbol.clone(),
                "stats": stats,
            });
            fs::write(tmp_dir.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

            fs::rename(&tmp_dir, &final_dir)?;
            Ok(final_dir.clone())
        })();

        if result.is_err() {
            let _ = fs::remove_dir_all(&tmp_dir);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JsonObject;

    fn event(seq: u64) -> Arc<TickEvent> {
        let mut raw = JsonObject::new();
        raw.insert("product_id".into(), "BTC-USD".into());
        raw.insert("sequence".into(), seq.into());
        Arc::new(TickEvent::from_json(raw, seq as i64))
    }

    fn recorder(dir: &std::path::Path, pre: usize, post: usize, cooldown: Duration) -> FlightRecorder {
        FlightRecorder::new(FlightConfig {
            pre_events: pre,
            post_events: post,
            cooldown,
            incidents_root: dir.to_path_buf(),
        })
    }

    fn bundle_dirs(root: &std::path::Path) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        dirs.sort();
        dirs
    }

    #[test]
    fn test_capture_writes_bundle_with_pre_and_post() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path(), 5, 3, Duration::from_secs(60));

        for seq in 1..=10 {
            rec.record(&event(seq), DetectorStats::default());
        }
        // ring now holds 6..=10; event 10 is the trigger
        rec.trigger(IncidentKind::SequenceGap, event(10).to_jsonl_value(), "BTC-USD");
        for seq in 11..=13 {
            rec.record(&event(seq), DetectorStats::default());
        }

        assert!(!rec.is_capturing());
        assert_eq!(rec.incidents_written(), 1);

        let dirs = bundle_dirs(dir.path());
        assert_eq!(dirs.len(), 1);
        assert!(!dirs[0].to_string_lossy().ends_with(".tmp"));

        let meta: Value =
            serde_json::from_str(&fs::read_to_string(dirs[0].join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta["type"], "sequence_gap");
        assert_eq!(meta["pre_count"], 5);
        assert_eq!(meta["post_count"], 3);
        assert_eq!(meta["symbol"], "BTC-USD");
        assert_eq!(meta["stats"]["incidents"], 1);

        let events = fs::read_to_string(dirs[0].join("events.jsonl")).unwrap();
        let seqs: Vec<u64> = events
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["sequence"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, vec![6, 7, 8, 9, 10, 11, 12, 13]);
    }

    #[test]
    fn test_trigger_ignored_while_capturing() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path(), 5, 10, Duration::from_secs(60));

        rec.record(&event(1), DetectorStats::default());
        rec.trigger(IncidentKind::DuplicateDetected, event(1).to_jsonl_value(), "BTC-USD");
        rec.record(&event(2), DetectorStats::default());
        rec.trigger(IncidentKind::SequenceGap, event(2).to_jsonl_value(), "BTC-USD");

        assert!(rec.is_capturing());
        assert_eq!(bundle_dirs(dir.path()).len(), 0);
    }

    #[test]
    fn test_cooldown_blocks_then_allows() {
        let dir = tempfile::tempdir().unwrap();
        let cooldown = Duration::from_millis(50);
        let mut rec = recorder(dir.path(), 5, 1, cooldown);

        rec.record(&event(1), DetectorStats::default());
        rec.trigger(IncidentKind::DuplicateDetected, event(1).to_jsonl_value(), "BTC-USD");
        rec.record(&event(2), DetectorStats::default());
        assert_eq!(rec.incidents_written(), 1);

        // inside cooldown: trigger ignored
        rec.record(&event(3), DetectorStats::default());
        rec.trigger(IncidentKind::DuplicateDetected, event(3).to_jsonl_value(), "BTC-USD");
        assert!(!rec.is_capturing());

        std::thread::sleep(cooldown + Duration::from_millis(10));
        rec.record(&event(4), DetectorStats::default());
        rec.trigger(IncidentKind::DuplicateDetected, event(4).to_jsonl_value(), "BTC-USD");
        rec.record(&event(5), DetectorStats::default());

        assert_eq!(rec.incidents_written(), 2);
        assert_eq!(bundle_dirs(dir.path()).len(), 2);
    }

    #[test]
    fn test_partial_finalize_truncates_post_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path(), 5, 100, Duration::from_secs(60));

        for seq in 1..=3 {
            rec.record(&event(seq), DetectorStats::default());
        }
        rec.trigger(IncidentKind::LatencySpike, event(3).to_jsonl_value(), "BTC-USD");
        rec.record(&event(4), DetectorStats::default());
        rec.finalize_partial(DetectorStats::default());

        let dirs = bundle_dirs(dir.path());
        assert_eq!(dirs.len(), 1);
        let meta: Value =
            serde_json::from_str(&fs::read_to_string(dirs[0].join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta["type"], "latency_spike");
        assert_eq!(meta["pre_count"], 3);
        assert_eq!(meta["post_count"], 1);
    }

    #[test]
    fn test_no_committed_dir_without_meta() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path(), 5, 2, Duration::from_secs(60));

        for seq in 1..=4 {
            rec.record(&event(seq), DetectorStats::default());
            if seq == 2 {
                rec.trigger(IncidentKind::SequenceGap, event(2).to_jsonl_value(), "BTC-USD");
            }
        }

        for path in bundle_dirs(dir.path()) {
            assert!(!path.to_string_lossy().ends_with(".tmp"));
            assert!(path.join("meta.json").exists());
            assert!(path.join("events.jsonl").exists());
        }
    }

    #[test]
    fn test_capture_failure_enters_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("not_a_dir");
        fs::write(&bogus, b"file in the way").unwrap();

        // incidents root is a file: every bundle write fails
        let mut rec = recorder(&bogus, 5, 1, Duration::from_secs(60));
        rec.record(&event(1), DetectorStats::default());
        rec.trigger(IncidentKind::DuplicateDetected, event(1).to_jsonl_value(), "BTC-USD");
        rec.record(&event(2), DetectorStats::default());

        assert_eq!(rec.incidents_written(), 0);
        assert!(!rec.is_capturing());

        // still cooling down, new trigger ignored
        rec.record(&event(3), DetectorStats::default());
        rec.trigger(IncidentKind::DuplicateDetected, event(3).to_jsonl_value(), "BTC-USD");
        assert!(!rec.is_capturing());
    }
}
