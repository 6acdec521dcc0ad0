//! Outbound publication of telemetry snapshots.
//!
//! A [`Publication`] is the serialised form of one relayed snapshot. Sinks
//! deliver it once; failures are reported to the relay, which logs them.

pub mod http;
pub mod stdout;

use crate::aggregator::TelemetrySnapshot;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Default endpoint of the HTTP sink.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/whoop-data";

/// JSON body sent for one relay tick.
///
/// Channels that were never observed (or are not selected) serialise as `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Publication {
    /// RFC 3339 UTC time the publication was built
    pub timestamp: String,
    pub hr: Option<u16>,
    pub rr_intervals: Option<Vec<f64>>,
    pub battery: Option<u8>,
}

impl Publication {
    pub fn from_snapshot(snapshot: &TelemetrySnapshot, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, true),
            hr: snapshot.heart_rate.as_ref().map(|o| o.value),
            rr_intervals: snapshot.rr_intervals.as_ref().map(|o| o.value.clone()),
            battery: snapshot.battery.as_ref().and_then(|o| o.value.percent()),
        }
    }
}

/// Errors raised while publishing.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Boxed future returned by [`Sink::publish`].
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Destination for relayed telemetry.
pub trait Sink: Send + Sync {
    fn publish<'a>(&'a self, publication: &'a Publication) -> SinkFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::TelemetryAggregator;
    use crate::measurement::{BatteryLevel, Measurement};
    use crate::test_utils::{heart_rate, ts};
    use serde_json::json;

    #[test]
    fn test_empty_snapshot_serialises_nulls() {
        let publication = Publication::from_snapshot(&TelemetrySnapshot::default(), ts(0));
        assert_eq!(
            serde_json::to_value(&publication).unwrap(),
            json!({
                "timestamp": "2024-01-01T00:00:00.000000Z",
                "hr": null,
                "rr_intervals": null,
                "battery": null,
            })
        );
    }

    #[test]
    fn test_full_snapshot() {
        let aggregator = TelemetryAggregator::default();
        aggregator.merge_at(heart_rate(75, Some(50), &[0.5, 0.75]), ts(1));
        aggregator.merge_at(Measurement::Battery(BatteryLevel::Percent(64)), ts(2));

        let publication = Publication::from_snapshot(&aggregator.snapshot(), ts(3));
        assert_eq!(
            serde_json::to_value(&publication).unwrap(),
            json!({
                "timestamp": "2024-01-01T00:00:03.000000Z",
                "hr": 75,
                "rr_intervals": [0.5, 0.75],
                "battery": 64,
            })
        );
    }

    #[test]
    fn test_unknown_battery_is_null() {
        let aggregator = TelemetryAggregator::default();
        aggregator.merge_at(Measurement::Battery(BatteryLevel::Unknown), ts(1));
        let publication = Publication::from_snapshot(&aggregator.snapshot(), ts(1));
        assert_eq!(publication.battery, None);
    }

    #[test]
    fn test_sink_error_display() {
        let err = SinkError::Status {
            status: 503,
            url: DEFAULT_ENDPOINT.into(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP 503 from http://localhost:8000/whoop-data"
        );
        assert_eq!(
            SinkError::Timeout(Duration::from_secs(2)).to_string(),
            "Publish timed out after 2s"
        );
    }
}
