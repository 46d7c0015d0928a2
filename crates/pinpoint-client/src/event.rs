//! Events published by the messenger.

use pinpoint_proto::{ErrorKind, PeerAddress};

/// Notifications for the application layer.
///
/// Delivered on a `tokio::sync::broadcast` channel. A subscriber that falls
/// more than the configured capacity behind loses the oldest events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessengerEvent {
    /// The directory rejected our credentials. The user must sign in again.
    Unauthorized,

    /// Our own device was replaced or removed remotely. Local state must be
    /// reset before anything else can succeed.
    RemoteDeviceChanged,

    /// A peer's identity changed and awaits consent.
    IdentityChanged {
        /// Peer whose identity changed
        peer: PeerAddress,
        /// Fingerprint of the pending identity
        fingerprint: String,
    },

    /// Post-receive key maintenance failed. Retried on the next cycle.
    MaintenanceFailed {
        /// Failure classification
        kind: ErrorKind,
    },

    /// A live broadcast send failed for one recipient.
    BroadcastFailed {
        /// Recipient of the failed send
        recipient: PeerAddress,
        /// Failure classification
        kind: ErrorKind,
    },
}
