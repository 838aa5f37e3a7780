//! 128-bit beacon identity.
//!
//! iBeacon advertisements carry a 16-byte proximity UUID. Tilt hydrometers
//! use that UUID to tell their colour apart, so it is the only identity we
//! key devices by.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A beacon identity stored as its raw 16 bytes (network order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BeaconId(pub [u8; 16]);

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Errors returned when parsing a beacon identity string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseBeaconIdError {
    #[error("invalid beacon id: expected 32 hex digits, got {0}")]
    InvalidLength(usize),
    #[error("invalid beacon id: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for BeaconId {
    type Err = ParseBeaconIdError;

    /// Accepts both the compact form (`a495bb10c5b1...`) and the dashed UUID
    /// form (`a495bb10-c5b1-4b44-...`), in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.trim().chars().filter(|c| *c != '-').collect();
        if digits.len() != 32 {
            return Err(ParseBeaconIdError::InvalidLength(digits.len()));
        }

        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = digits
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| ParseBeaconIdError::InvalidHex(digits.clone()))?;
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| ParseBeaconIdError::InvalidHex(pair.to_string()))?;
        }

        Ok(BeaconId(bytes))
    }
}

impl From<[u8; 16]> for BeaconId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl From<uuid::Uuid> for BeaconId {
    fn from(id: uuid::Uuid) -> Self {
        Self(*id.as_bytes())
    }
}
