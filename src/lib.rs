//! `hrm-relay` library.
//!
//! Connects to a Bluetooth LE heart rate monitor, decodes its GATT
//! notifications into a latest-value snapshot and relays that snapshot to a
//! sink at a bounded rate while the link is healthy.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, signals and
//! process exit codes. The wiring lives in [`crate::app`] where it can be tested
//! deterministically with an injected link and sink.

pub mod aggregator;
pub mod app;
pub mod backoff;
pub mod connection;
pub mod link;
pub mod mac_address;
pub mod measurement;
pub mod protocol;
pub mod relay;
pub mod shutdown;
pub mod sink;
pub mod throttle;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use aggregator::{TelemetryAggregator, TelemetrySnapshot};
pub use backoff::{BackoffConfig, BackoffPolicy};
pub use connection::{
    ConnectionError, ConnectionManager, ConnectionState, LinkStatus, ManagerConfig,
};
pub use link::{Backend, LinkError, LinkHandle, RadioLink};
pub use mac_address::MacAddress;
pub use measurement::{BatteryLevel, Channel, ChannelSet, HeartRateMeasurement, Measurement};
pub use protocol::{DecodeError, decode, decode_battery, decode_heart_rate};
pub use relay::{RelayConfig, RelayScheduler, RelayStats};
pub use sink::{Publication, Sink, SinkError};
pub use throttle::{Throttle, parse_duration, parse_interval};
