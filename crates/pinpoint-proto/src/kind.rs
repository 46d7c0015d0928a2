//! Error taxonomy shared by every layer.

use serde::{Deserialize, Serialize};

/// Coarse classification of every failure the system can surface.
///
/// Each kind maps to a distinct user-facing message and a distinct recovery
/// action. Layers keep their own detailed error enums and classify into this
/// one at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Transport failure or timeout. Retriable.
    Network,
    /// Malformed local or remote data. Not retriable without repair.
    Format,
    /// Opaque server-side failure. Retriable.
    ServerError,
    /// Rate limited. Retry after a delay.
    Throttled,
    /// Credentials rejected. Terminal for this login.
    Unauthorized,
    /// Peer's long-term identity changed. Needs user consent.
    AlteredIdentity,
    /// Our own device record changed remotely. Needs a full local reset.
    RemoteDeviceChanged,
    /// No local device exists yet.
    NoLocalDevice,
    /// A device is already registered for this identity.
    DeviceAlreadyExists,
    /// Recipient account does not exist.
    RecipientNotFound,
    /// Recipient exists but has no registered device.
    RecipientHasNoDevice,
    /// Local secure storage failed. Retriable.
    Storage,
}

impl ErrorKind {
    /// True if the same call may succeed when simply retried later.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Network | Self::ServerError | Self::Throttled | Self::Storage)
    }

    /// Actionable message for the user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Network => "Network unavailable. Check your connection and try again.",
            Self::Format => "Received data could not be read and was discarded.",
            Self::ServerError => "The server had a problem. Try again in a moment.",
            Self::Throttled => "Too many requests. Wait a little before trying again.",
            Self::Unauthorized => "Your login expired. Sign in again to continue.",
            Self::AlteredIdentity => {
                "This contact's security key changed. Verify it before sharing again."
            },
            Self::RemoteDeviceChanged => {
                "This device was replaced on another phone. Set it up again to continue."
            },
            Self::NoLocalDevice => "Set up this device before sharing locations.",
            Self::DeviceAlreadyExists => {
                "A device is already registered for this account. Remove it first."
            },
            Self::RecipientNotFound => "That contact does not exist.",
            Self::RecipientHasNoDevice => "That contact has not set up a device yet.",
            Self::Storage => "Secure storage on this device is unavailable. Try again.",
        }
    }
}
