//! Raw Event Recorder
//!
//! Optional consumer (RECORD=true) that appends every decoded event
//! verbatim to a JSONL file for later replay. Writes block only this
//! consumer's own subscription; a slow disk shows up as recorder drops,
//! never as publish latency.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::Subscription;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub struct RawRecorder {
    path: PathBuf,
}

impl RawRecorder {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn run(self, sub: Subscription) {
        let mut writer = match self.open() {
            Ok(w) => w,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "recorder disabled: open failed");
                return;
            }
        };
        info!(path = %self.path.display(), "raw recorder started");

        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        let mut written = 0u64;

        loop {
            tokio::select! {
                event = sub.recv() => {
                    let Some(event) = event else { break };
                    let line = event.to_jsonl_value();
                    if let Err(e) = serde_json::to_writer(&mut writer, &line)
                        .map_err(std::io::Error::from)
                        .and_then(|_| writer.write_all(b"\n"))
                    {
                        warn!(error = %e, "recorder write failed");
                    } else {
                        written += 1;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = writer.flush() {
                        warn!(error = %e, "recorder flush failed");
                    }
                }
            }
        }

        let _ = writer.flush();
        info!(written, "raw recorder stopped");
    }

    fn open(&self) -> std::io::Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::model::{JsonObject, TickEvent};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_records_events_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.jsonl");
        let bus = Bus::new(100);
        let sub = bus.subscribe("recorder");

        for seq in 0..5u64 {
            let mut raw = JsonObject::new();
            raw.insert("sequence".into(), seq.into());
            bus.publish(Arc::new(TickEvent::from_json(raw, seq as i64)));
        }
        bus.close_all();

        RawRecorder::new(path.clone()).run(sub).await;

        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 5);
        assert!(contents.lines().all(|l| l.contains("recv_ts_ms")));
    }
}
