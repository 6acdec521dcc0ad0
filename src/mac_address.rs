//! Bluetooth device addresses.
//!
//! Addresses are kept as plain bytes so the connection logic does not depend on
//! a particular Bluetooth stack. Conversions to `bluer::Address` are available
//! with the `bluer` feature.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 48-bit Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Errors returned when parsing a device address.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid device address: expected 6 octets, got {0}")]
    InvalidLength(usize),
    #[error("invalid device address: octet {0} must be two hex digits")]
    InvalidPartLength(usize),
    #[error("invalid device address: '{0}' is not valid hex")]
    InvalidHex(String),
    #[error("invalid device address: mixed ':' and '-' separators")]
    MixedSeparators,
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Parse `AA:BB:CC:DD:EE:FF` or `AA-BB-CC-DD-EE-FF`, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let separator = match (s.contains(':'), s.contains('-')) {
            (true, true) => return Err(ParseMacError::MixedSeparators),
            (false, true) => '-',
            _ => ':',
        };

        let parts: Vec<&str> = s.split(separator).collect();
        if parts.len() != 6 {
            return Err(ParseMacError::InvalidLength(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseMacError::InvalidPartLength(i));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseMacError::InvalidHex(part.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<MacAddress> for bluer::Address {
    fn from(addr: MacAddress) -> Self {
        bluer::Address(addr.0)
    }
}
