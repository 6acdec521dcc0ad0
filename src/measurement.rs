//! Decoded telemetry values and the channels they belong to.

use std::collections::BTreeSet;
use std::fmt;

/// A single decoded notification from the wearable.
///
/// Values are immutable once decoded; the aggregator copies what it keeps.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    /// Heart Rate Measurement characteristic (0x2A37)
    HeartRate(HeartRateMeasurement),
    /// Battery Level characteristic (0x2A19)
    Battery(BatteryLevel),
}

/// Fields carried by one Heart Rate Measurement notification.
///
/// - Heart rate in beats per minute (valid only when greater than zero)
/// - Energy expended in kilojoules, present only when the device sends it
/// - RR intervals in seconds, in the order the device reported them
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeartRateMeasurement {
    /// Heart rate in beats per minute
    pub bpm: u16,
    /// Cumulative energy expended in kilojoules
    pub energy_expended: Option<u16>,
    /// RR intervals in seconds (raw value / 1024)
    pub rr_intervals: Vec<f64>,
}

impl HeartRateMeasurement {
    /// `true` when the heart rate value is usable.
    pub fn has_valid_bpm(&self) -> bool {
        self.bpm > 0
    }

    /// RR intervals with protocol noise (zero or negative values) removed.
    pub fn valid_rr_intervals(&self) -> Vec<f64> {
        self.rr_intervals
            .iter()
            .copied()
            .filter(|rr| *rr > 0.0)
            .collect()
    }
}

/// Battery charge as reported by the Battery Level characteristic.
///
/// An empty read is modelled as [`BatteryLevel::Unknown`] rather than 0%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatteryLevel {
    #[default]
    Unknown,
    Percent(u8),
}

impl BatteryLevel {
    /// The percentage, if known.
    pub fn percent(self) -> Option<u8> {
        match self {
            BatteryLevel::Percent(p) => Some(p),
            BatteryLevel::Unknown => None,
        }
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryLevel::Unknown => write!(f, "unknown"),
            BatteryLevel::Percent(p) => write!(f, "{p}%"),
        }
    }
}

/// Telemetry channel kinds tracked by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum Channel {
    HeartRate,
    EnergyExpended,
    RrIntervals,
    Battery,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::HeartRate,
        Channel::EnergyExpended,
        Channel::RrIntervals,
        Channel::Battery,
    ];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::HeartRate => "heart-rate",
            Channel::EnergyExpended => "energy-expended",
            Channel::RrIntervals => "rr-intervals",
            Channel::Battery => "battery",
        };
        f.write_str(name)
    }
}

/// The set of channels selected for collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSet(BTreeSet<Channel>);

impl ChannelSet {
    /// Every channel.
    pub fn all() -> Self {
        Channel::ALL.into_iter().collect()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0.contains(&channel)
    }

    /// `true` when any channel carried by the heart rate characteristic is selected.
    pub fn wants_heart_rate_notifications(&self) -> bool {
        self.contains(Channel::HeartRate)
            || self.contains(Channel::EnergyExpended)
            || self.contains(Channel::RrIntervals)
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
