//! Latest-value store shared between the notification path and the relay.
//!
//! The aggregator keeps exactly one value per channel (last write wins) and
//! no history. Writers and readers go through a single mutex, so a snapshot
//! always reflects whole merges.

use crate::measurement::{BatteryLevel, Channel, ChannelSet, HeartRateMeasurement, Measurement};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A value together with the time it was merged.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed<T> {
    pub value: T,
    pub observed_at: DateTime<Utc>,
}

/// Point-in-time copy of the latest value per channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetrySnapshot {
    pub heart_rate: Option<Observed<u16>>,
    pub energy_expended: Option<Observed<u16>>,
    pub rr_intervals: Option<Observed<Vec<f64>>>,
    pub battery: Option<Observed<BatteryLevel>>,
}

impl TelemetrySnapshot {
    /// `true` if no channel has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.heart_rate.is_none()
            && self.energy_expended.is_none()
            && self.rr_intervals.is_none()
            && self.battery.is_none()
    }

    /// The most recent observation time across all channels.
    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        [
            self.heart_rate.as_ref().map(|o| o.observed_at),
            self.energy_expended.as_ref().map(|o| o.observed_at),
            self.rr_intervals.as_ref().map(|o| o.observed_at),
            self.battery.as_ref().map(|o| o.observed_at),
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

/// Merges decoded measurements into a [`TelemetrySnapshot`].
#[derive(Debug)]
pub struct TelemetryAggregator {
    channels: ChannelSet,
    snapshot: Mutex<TelemetrySnapshot>,
}

impl TelemetryAggregator {
    pub fn new(channels: ChannelSet) -> Self {
        Self {
            channels,
            snapshot: Mutex::new(TelemetrySnapshot::default()),
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn lock(&self) -> MutexGuard<'_, TelemetrySnapshot> {
        // The snapshot holds plain values; a panic mid-merge cannot leave it torn.
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a measurement observed now. Returns `true` if any channel changed.
    pub fn merge(&self, measurement: Measurement) -> bool {
        self.merge_at(measurement, Utc::now())
    }

    /// Merge a measurement with an explicit observation time.
    ///
    /// Filtering: a heart rate of 0 is not merged, RR values `<= 0` are dropped and
    /// an RR list left empty is not merged, unselected channels are ignored.
    pub fn merge_at(&self, measurement: Measurement, observed_at: DateTime<Utc>) -> bool {
        match measurement {
            Measurement::HeartRate(hr) => self.merge_heart_rate(hr, observed_at),
            Measurement::Battery(level) => {
                if !self.channels.contains(Channel::Battery) {
                    return false;
                }
                self.lock().battery = Some(Observed {
                    value: level,
                    observed_at,
                });
                true
            }
        }
    }

    fn merge_heart_rate(&self, hr: HeartRateMeasurement, observed_at: DateTime<Utc>) -> bool {
        let rr = hr.valid_rr_intervals();
        let mut snapshot = self.lock();
        let mut changed = false;

        if self.channels.contains(Channel::HeartRate) && hr.has_valid_bpm() {
            snapshot.heart_rate = Some(Observed {
                value: hr.bpm,
                observed_at,
            });
            changed = true;
        }

        if let Some(energy) = hr.energy_expended
            && self.channels.contains(Channel::EnergyExpended)
        {
            snapshot.energy_expended = Some(Observed {
                value: energy,
                observed_at,
            });
            changed = true;
        }

        if !rr.is_empty() && self.channels.contains(Channel::RrIntervals) {
            snapshot.rr_intervals = Some(Observed {
                value: rr,
                observed_at,
            });
            changed = true;
        }

        changed
    }

    /// A consistent copy of the current values.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.lock().clone()
    }
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new(ChannelSet::all())
    }
}
