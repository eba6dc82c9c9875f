//! MercuryStream Processor Daemon
//!
//! Ingests framed trade ticks over TCP, fans them out to the analytic
//! consumers, and runs forensics with flight-recorder incident capture.
//!
//! Environment:
//!   HOST, PORT                  - TCP bind (default 0.0.0.0:9001)
//!   METRICS_PORT                - Prometheus endpoint (default 9090)
//!   FORENSICS                   - enable the forensics consumer (default true)
//!   RECORD, RECORD_FILE         - optional raw recorder (default off)
//!   LATENCY_SPIKE_THRESHOLD_MS  - p99 trigger (default 100)
//!   DUPLICATE_LRU_MAX           - duplicate LRU size (default 50000)
//!   FLIGHT_PRE_EVENTS           - ring capacity (default 5000)
//!   FLIGHT_POST_EVENTS          - post-trigger capture size (default 3000)
//!   FLIGHT_COOLDOWN_S           - min seconds between incidents (default 60)
//!   BUS_QUEUE_CAPACITY          - per-subscriber queue (default 1000)
//!   DATA_DIR                    - incidents/samples root (default data)
//!
//! Exit codes: 0 clean shutdown, 1 bind failure, 2 fatal misconfiguration.

use std::time::Duration;

use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use mercury_stream::config::Config;
use mercury_stream::consumers::{HealthConsumer, VolatilityConsumer, VolumeConsumer, VwapConsumer};
use mercury_stream::flight::FlightConfig;
use mercury_stream::forensics::{Forensics, ForensicsConfig};
use mercury_stream::recorder::RawRecorder;
use mercury_stream::{bus::Bus, metrics, server};

const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("fatal misconfiguration: {}", e);
            std::process::exit(2);
        }
    };

    info!("starting mercurystream processor");
    info!("  listen: {}", config.listen_addr());
    info!("  metrics port: {}", config.metrics_port);
    info!("  forensics: {}", config.forensics);
    info!("  record: {}", config.record);
    info!("  bus queue capacity: {}", config.bus_queue_capacity);
    info!(
        "  flight recorder: pre={} post={} cooldown={}s",
        config.flight_pre_events,
        config.flight_post_events,
        config.flight_cooldown.as_secs()
    );

    let listener = match TcpListener::bind(config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.listen_addr(), error = %e, "bind failed");
            std::process::exit(1);
        }
    };

    let bus = Bus::new(config.bus_queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    metrics::spawn_server(config.metrics_port);
    let flush = tokio::spawn(metrics::flush_loop(bus.clone(), shutdown_rx.clone()));

    let mut consumers: Vec<(&str, JoinHandle<()>)> = Vec::new();

    let vwap = VwapConsumer::new(config.log_interval);
    consumers.push(("vwap", tokio::spawn(vwap.run(bus.subscribe("vwap")))));

    let volatility = VolatilityConsumer::new(config.log_interval);
    consumers.push((
        "volatility",
        tokio::spawn(volatility.run(bus.subscribe("volatility"))),
    ));

    let volume = VolumeConsumer::new();
    consumers.push(("volume", tokio::spawn(volume.run(bus.subscribe("volume")))));

    let health = HealthConsumer::new(bus.clone());
    consumers.push(("health", tokio::spawn(health.run(bus.subscribe("health")))));

    if config.forensics {
        let forensics = Forensics::new(ForensicsConfig {
            lru_max: config.duplicate_lru_max,
            spike_threshold_ms: config.latency_spike_threshold_ms,
            latency_window: 1000,
            drift_sample_path: config.drift_samples_path(),
            flight: FlightConfig {
                pre_events: config.flight_pre_events,
                post_events: config.flight_post_events,
                cooldown: config.flight_cooldown,
                incidents_root: config.incidents_root(),
            },
        });
        consumers.push((
            "forensics",
            tokio::spawn(forensics.run(bus.subscribe("forensics"))),
        ));
    }

    if config.record {
        let recorder = RawRecorder::new(config.record_file.clone());
        consumers.push((
            "recorder",
            tokio::spawn(recorder.run(bus.subscribe("recorder"))),
        ));
    }

    let server_task = tokio::spawn(server::run(listener, bus.clone(), shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received");

    // Stop accepting and close connections, then let consumers drain
    // their queues up to the deadline.
    let _ = shutdown_tx.send(true);
    if let Err(e) = server_task.await {
        warn!(error = %e, "ingest server task failed");
    }
    bus.close_all();

    let deadline = Instant::now() + DRAIN_DEADLINE;
    for (name, handle) in consumers {
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(consumer = name, error = %e, "consumer task failed"),
            Err(_) => warn!(consumer = name, "drain deadline hit, abandoning"),
        }
    }
    flush.abort();

    info!("shutdown complete");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
