//! Environment Configuration
//!
//! Every knob the processor honors, read from the environment. Unset
//! variables fall back to their defaults; a variable that is set but
//! unparseable is fatal misconfiguration and surfaces as a
//! [`ConfigError`] (exit code 2 in the daemon) rather than a silent
//! default.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::DEFAULT_QUEUE_CAPACITY;
use crate::consumers::vwap::DEFAULT_LOG_INTERVAL;
use crate::flight::{DEFAULT_COOLDOWN, DEFAULT_POST_EVENTS, DEFAULT_PRE_EVENTS};
use crate::forensics::{DEFAULT_LRU_MAX, DEFAULT_SPIKE_THRESHOLD_MS};

#[derive(Debug)]
pub struct ConfigError {
    pub var: String,
    pub value: String,
    pub reason: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid {}={:?}: {}",
            self.var, self.value, self.reason
        )
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub record: bool,
    pub record_file: PathBuf,
    pub forensics: bool,
    pub latency_spike_threshold_ms: i64,
    pub duplicate_lru_max: usize,
    pub flight_pre_events: usize,
    pub flight_post_events: usize,
    pub flight_cooldown: Duration,
    pub bus_queue_capacity: usize,
    pub data_dir: PathBuf,
    pub log_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9001,
            metrics_port: 9090,
            record: false,
            record_file: PathBuf::from("data/btcusd.jsonl"),
            forensics: true,
            latency_spike_threshold_ms: DEFAULT_SPIKE_THRESHOLD_MS,
            duplicate_lru_max: DEFAULT_LRU_MAX,
            flight_pre_events: DEFAULT_PRE_EVENTS,
            flight_post_events: DEFAULT_POST_EVENTS,
            flight_cooldown: DEFAULT_COOLDOWN,
            bus_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            data_dir: PathBuf::from("data"),
            log_interval: DEFAULT_LOG_INTERVAL,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_var("PORT", defaults.port)?,
            metrics_port: parse_var("METRICS_PORT", defaults.metrics_port)?,
            record: bool_var("RECORD", defaults.record)?,
            record_file: env::var("RECORD_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.record_file),
            forensics: bool_var("FORENSICS", defaults.forensics)?,
            latency_spike_threshold_ms: positive_var(
                "LATENCY_SPIKE_THRESHOLD_MS",
                defaults.latency_spike_threshold_ms,
            )?,
            duplicate_lru_max: positive_var("DUPLICATE_LRU_MAX", defaults.duplicate_lru_max)?,
            flight_pre_events: positive_var("FLIGHT_PRE_EVENTS", defaults.flight_pre_events)?,
            flight_post_events: positive_var("FLIGHT_POST_EVENTS", defaults.flight_post_events)?,
            flight_cooldown: parse_var("FLIGHT_COOLDOWN_S", defaults.flight_cooldown.as_secs())
                .map(Duration::from_secs)?,
            bus_queue_capacity: positive_var("BUS_QUEUE_CAPACITY", defaults.bus_queue_capacity)?,
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            log_interval: positive_var("LOG_INTERVAL", defaults.log_interval)?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn incidents_root(&self) -> PathBuf {
        self.data_dir.join("incidents")
    }

    pub fn drift_samples_path(&self) -> PathBuf {
        self.data_dir.join("drift_samples.jsonl")
    }
}

fn parse_var<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => value.parse().map_err(|_| ConfigError {
            var: var.to_string(),
            value,
            reason: format!("expected {}", std::any::type_name::<T>()),
        }),
    }
}

/// Like [`parse_var`] but zero is as fatal as garbage: these are window
/// and capacity sizes where 0 means a misconfigured deployment.
fn positive_var<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + std::fmt::Debug,
{
    let parsed = parse_var(var, default)?;
    if parsed <= T::default() {
        return Err(ConfigError {
            var: var.to_string(),
            value: format!("{:?}", parsed),
            reason: "must be positive".to_string(),
        });
    }
    Ok(parsed)
}

fn bool_var(var: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => match value.as_str() {
            "1" | "true" | "TRUE" | "on" | "ON" => Ok(true),
            "0" | "false" | "FALSE" | "off" | "OFF" => Ok(false),
            _ => Err(ConfigError {
                var: var.to_string(),
                value,
                reason: "expected a boolean (1/true/on or 0/false/off)".to_string(),
            }),
        },
    }
}
