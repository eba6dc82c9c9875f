//! Analytic Consumers
//!
//! Every consumer follows the same shape: subscribe to the bus, loop on
//! `recv().await` with task-local state, emit a structured summary
//! periodically. A consumer that falls behind shows up as backpressure
//! drops on its subscription; the consumer itself keeps running.

pub mod health;
pub mod volatility;
pub mod volume;
pub mod vwap;

pub use health::HealthConsumer;
pub use volatility::VolatilityConsumer;
pub use volume::VolumeConsumer;
pub use vwap::VwapConsumer;
