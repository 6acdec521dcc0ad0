//! Decoding of the GATT Heart Rate and Battery Level characteristics.
//!
//! Both decoders are pure functions over the raw notification (or read) payload.
//! See the Bluetooth SIG Heart Rate Service specification for the wire layout.

use crate::measurement::{BatteryLevel, HeartRateMeasurement, Measurement};
use thiserror::Error;
use uuid::Uuid;

/// Heart Rate service (0x180D).
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (0x2A37).
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Battery service (0x180F).
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Battery Level characteristic (0x2A19).
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Flags bit 0: heart rate value is a 16-bit integer.
pub const FLAG_HR_16BIT: u8 = 0x01;
/// Flags bit 3: energy expended field present.
pub const FLAG_ENERGY_EXPENDED: u8 = 0x08;
/// Flags bit 4: one or more RR interval fields present.
pub const FLAG_RR_INTERVALS: u8 = 0x10;

/// RR intervals are transmitted in units of 1/1024 second.
pub const RR_UNITS_PER_SECOND: f64 = 1024.0;

/// Errors produced while decoding characteristic payloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload is shorter than its own flags require
    #[error("Truncated {field}: needed {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    /// Battery level outside 0..=100
    #[error("Battery level out of range: {0}")]
    BatteryOutOfRange(u8),
    /// Payload arrived on a characteristic this crate does not decode
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),
}

/// Cursor over a payload that reports truncation per field.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        let byte = *self.data.get(self.pos).ok_or(DecodeError::Truncated {
            field,
            needed: 1,
            available: 0,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16_le(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        if self.remaining() < 2 {
            return Err(DecodeError::Truncated {
                field,
                needed: 2,
                available: self.remaining(),
            });
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }
}

/// Decode a Heart Rate Measurement notification.
///
/// Layout:
/// 1. flags byte
/// 2. heart rate, `u8` or little-endian `u16` depending on flags bit 0
/// 3. energy expended, little-endian `u16`, if flags bit 3 is set
/// 4. RR intervals, little-endian `u16` each, if flags bit 4 is set
///
/// RR parsing consumes 2-byte chunks until fewer than 2 bytes remain; a single
/// dangling byte at the end is ignored.
///
/// # Errors
/// Returns [`DecodeError::Truncated`] if the flags byte, the heart rate value or
/// the energy field is cut short. No partial measurement is ever returned.
///
/// # Example
/// ```
/// use hrm_relay::protocol::decode_heart_rate;
///
/// let m = decode_heart_rate(&[0x10, 0x4B, 0x00, 0x04]).unwrap();
/// assert_eq!(m.bpm, 75);
/// assert_eq!(m.rr_intervals, vec![1.0]);
/// ```
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    let mut reader = Reader::new(data);
    let flags = reader.u8("flags")?;

    let bpm = if flags & FLAG_HR_16BIT != 0 {
        reader.u16_le("heart rate (16-bit)")?
    } else {
        u16::from(reader.u8("heart rate (8-bit)")?)
    };

    let energy_expended = if flags & FLAG_ENERGY_EXPENDED != 0 {
        Some(reader.u16_le("energy expended")?)
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flags & FLAG_RR_INTERVALS != 0 {
        while reader.remaining() >= 2 {
            let raw = reader.u16_le("rr interval")?;
            rr_intervals.push(f64::from(raw) / RR_UNITS_PER_SECOND);
        }
    }

    Ok(HeartRateMeasurement {
        bpm,
        energy_expended,
        rr_intervals,
    })
}

/// Decode a Battery Level read or notification.
///
/// An empty payload yields [`BatteryLevel::Unknown`]. Extra bytes after the first
/// are ignored.
pub fn decode_battery(data: &[u8]) -> Result<BatteryLevel, DecodeError> {
    match data.first() {
        None => Ok(BatteryLevel::Unknown),
        Some(&level) if level <= 100 => Ok(BatteryLevel::Percent(level)),
        Some(&level) => Err(DecodeError::BatteryOutOfRange(level)),
    }
}

/// Decode a payload according to the characteristic it arrived on.
pub fn decode(characteristic: Uuid, data: &[u8]) -> Result<Measurement, DecodeError> {
    if characteristic == HEART_RATE_MEASUREMENT {
        decode_heart_rate(data).map(Measurement::HeartRate)
    } else if characteristic == BATTERY_LEVEL {
        decode_battery(data).map(Measurement::Battery)
    } else {
        Err(DecodeError::UnknownCharacteristic(characteristic))
    }
}

impl HeartRateMeasurement {
    /// Encode into the Heart Rate Measurement wire format.
    ///
    /// The 16-bit heart rate form is only used when `bpm` does not fit in a byte.
    /// RR intervals are quantized to 1/1024 s and saturate at `u16::MAX`.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        let mut body = Vec::with_capacity(4 + self.rr_intervals.len() * 2);

        match u8::try_from(self.bpm) {
            Ok(bpm) => body.push(bpm),
            Err(_) => {
                flags |= FLAG_HR_16BIT;
                body.extend_from_slice(&self.bpm.to_le_bytes());
            }
        }

        if let Some(energy) = self.energy_expended {
            flags |= FLAG_ENERGY_EXPENDED;
            body.extend_from_slice(&energy.to_le_bytes());
        }

        if !self.rr_intervals.is_empty() {
            flags |= FLAG_RR_INTERVALS;
            for rr in &self.rr_intervals {
                let raw = (rr * RR_UNITS_PER_SECOND).round().clamp(0.0, f64::from(u16::MAX)) as u16;
                body.extend_from_slice(&raw.to_le_bytes());
            }
        }

        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(flags);
        out.extend(body);
        out
    }
}
