//! MercuryStream Processor Library
//!
//! Real-time market-data processor: framed TCP ingest, in-process fan-out
//! with drop-oldest backpressure, multi-signal anomaly forensics, and a
//! flight recorder that captures the events surrounding an anomaly into
//! self-contained incident bundles.
//!
//! Exposes core modules for the mercuryd binary and tests.

pub mod bus;
pub mod config;
pub mod consumers;
pub mod flight;
pub mod forensics;
pub mod metrics;
pub mod model;
pub mod recorder;
pub mod server;
pub mod wire;

// Re-export the types most callers touch
pub use bus::{Bus, Subscription};
pub use config::Config;
pub use flight::{FlightConfig, FlightRecorder, IncidentKind};
pub use forensics::{Forensics, ForensicsConfig};
pub use model::TickEvent;
