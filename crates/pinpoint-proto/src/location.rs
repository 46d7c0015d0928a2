//! Location payload carried inside encrypted messages.

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, decode_cbor, encode_cbor};

/// Current message body version.
const BODY_VERSION: u8 = 1;

/// Maximum accepted accuracy radius in meters.
const MAX_ACCURACY_M: u32 = 10_000;

/// A WGS84 location sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees, -90 to 90.
    pub latitude: f64,
    /// Longitude in degrees, -180 to 180.
    pub longitude: f64,
    /// Accuracy radius in meters, 0 to 10000.
    pub accuracy_m: u32,
    /// Sample time, unix milliseconds.
    pub timestamp_ms: u64,
    /// End of the live-sharing window this sample belongs to, if any.
    pub live_until_ms: Option<u64>,
}

impl Location {
    /// Build a validated one-shot location.
    pub fn new(
        latitude: f64,
        longitude: f64,
        accuracy_m: u32,
        timestamp_ms: u64,
    ) -> Result<Self, ProtocolError> {
        let location = Self { latitude, longitude, accuracy_m, timestamp_ms, live_until_ms: None };
        location.validate()?;
        Ok(location)
    }

    /// Mark this sample as part of a live broadcast ending at `until_ms`.
    #[must_use]
    pub fn live_until(mut self, until_ms: u64) -> Self {
        self.live_until_ms = Some(until_ms);
        self
    }

    /// True if this sample belongs to a live broadcast.
    pub fn is_live(&self) -> bool {
        self.live_until_ms.is_some()
    }

    /// Check coordinate ranges.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ProtocolError::InvalidLocation("latitude must be between -90 and 90"));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ProtocolError::InvalidLocation("longitude must be between -180 and 180"));
        }
        if self.accuracy_m > MAX_ACCURACY_M {
            return Err(ProtocolError::InvalidLocation(
                "accuracy must be between 0 and 10000 meters",
            ));
        }
        Ok(())
    }
}

/// Plaintext body of an encrypted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Body format version.
    pub version: u8,
    /// The shared location.
    pub location: Location,
}

impl MessageBody {
    /// Wrap a location in a current-version body.
    pub fn new(location: Location) -> Self {
        Self { version: BODY_VERSION, location }
    }

    /// Serialize to CBOR plaintext.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_cbor(self)
    }

    /// Parse and validate CBOR plaintext.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let body: Self = decode_cbor(bytes)?;
        if body.version != BODY_VERSION {
            return Err(ProtocolError::UnsupportedVersion(body.version));
        }
        body.location.validate()?;
        Ok(body)
    }
}
