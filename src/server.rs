//! TCP Ingest Server
//!
//! Accepts framed connections from the ingester, decodes each frame,
//! stamps `recv_ts_ms`, and publishes to the bus. Errors stay
//! connection-local: a bad frame closes that connection, a non-JSON
//! payload is skipped, and no failure ever traverses the bus.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::model::TickEvent;
use crate::wire::FrameReader;

/// Run the accept loop until shutdown. The listener is bound by the
/// caller so bind failures can map to the right exit code.
pub async fn run(listener: TcpListener, bus: Bus, mut shutdown: watch::Receiver<bool>) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "ingest server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "ingester connected");
                        tokio::spawn(handle_connection(stream, peer.to_string(), bus.clone(), shutdown.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("ingest server stopping");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: String,
    bus: Bus,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = FrameReader::new(stream);
    let mut frames = 0u64;

    loop {
        tokio::select! {
            frame = reader.next_frame() => {
                match frame {
                    Ok(Some(payload)) => {
                        frames += 1;
                        publish_payload(&bus, &peer, &payload);
                    }
                    Ok(None) => {
                        info!(%peer, frames, "ingester disconnected");
                        return;
                    }
                    Err(e) => {
                        warn!(%peer, frames, error = %e, "frame error, closing connection");
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                info!(%peer, frames, "connection closing on shutdown");
                return;
            }
        }
    }
}

fn publish_payload(bus: &Bus, peer: &str, payload: &[u8]) {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(raw)) => {
            let event = TickEvent::from_json(raw, Utc::now().timestamp_millis());
            bus.publish(Arc::new(event));
        }
        Ok(_) => {
            debug!(peer, "non-object payload skipped");
        }
        Err(e) => {
            debug!(peer, error = %e, "malformed JSON payload skipped");
        }
    }
}
