//! Peer addressing.

use std::fmt;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Separator between name and device slot in a combined identifier.
pub const ADDRESS_SEPARATOR: char = '.';

/// Bytes escaped in the name part of a combined identifier. `/` would
/// split a storage namespace and `%` starts an escape.
const NAME_ESCAPES: &AsciiSet = &CONTROLS.add(b'/').add(b'%');

/// Numeric identifier of a registered device on the directory.
pub type RegistrationId = u32;

/// Stable identity key for all per-peer state.
///
/// Two addresses are equal iff both the name and the device slot match
/// exactly. The name is case sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Account name.
    pub name: String,
    /// Device slot under the account.
    pub device_slot: u32,
}

impl PeerAddress {
    /// Create an address.
    pub fn new(name: impl Into<String>, device_slot: u32) -> Self {
        Self { name: name.into(), device_slot }
    }

    /// Combined identifier `name.slot`, used as a storage-key prefix.
    ///
    /// The name is percent-escaped so the result never contains `/`, and
    /// one device's namespace can never sit inside another's.
    pub fn combined_id(&self) -> String {
        format!(
            "{}{ADDRESS_SEPARATOR}{}",
            utf8_percent_encode(&self.name, NAME_ESCAPES),
            self.device_slot
        )
    }

    /// Parse a combined identifier produced by [`Self::combined_id`].
    ///
    /// The slot is taken after the last separator so names may themselves
    /// contain dots.
    pub fn parse_combined(combined: &str) -> Result<Self, ProtocolError> {
        let (name, slot) = combined
            .rsplit_once(ADDRESS_SEPARATOR)
            .ok_or_else(|| ProtocolError::InvalidAddress(combined.to_string()))?;

        if name.is_empty() {
            return Err(ProtocolError::InvalidAddress(combined.to_string()));
        }

        let device_slot =
            slot.parse().map_err(|_| ProtocolError::InvalidAddress(combined.to_string()))?;
        let name = percent_decode_str(name)
            .decode_utf8()
            .map_err(|_| ProtocolError::InvalidAddress(combined.to_string()))?;

        Ok(Self::new(name, device_slot))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ADDRESS_SEPARATOR}{}", self.name, self.device_slot)
    }
}
