//! Message relay envelopes.

use serde::{Deserialize, Serialize};

use crate::{PeerAddress, RegistrationId};

/// Request body for submitting a ciphertext to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Recipient device.
    pub recipient: PeerAddress,
    /// Registration id the sender's session targets. The relay rejects the
    /// message as "device changed" if the recipient re-registered since.
    pub recipient_registration_id: RegistrationId,
    /// Sending device.
    pub sender: PeerAddress,
    /// Sender's registration id.
    pub sender_registration_id: RegistrationId,
    /// Encoded ciphertext message.
    pub ciphertext: Vec<u8>,
}

/// A pending message fetched from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Relay-assigned message id, used for deletion.
    pub id: u64,
    /// Encoded ciphertext message.
    pub ciphertext: Vec<u8>,
    /// Sender's registration id.
    pub sender_registration_id: RegistrationId,
    /// Sending device.
    pub sender: PeerAddress,
}

/// Per-id result of a batch delete, in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteOutcome {
    /// Message removed.
    Deleted,
    /// Message belongs to another device. Deterministic.
    NotOwner,
    /// No such message. Deterministic.
    Nonexistent,
    /// Server failed for this id. Transient.
    ServerError,
}

impl DeleteOutcome {
    /// True if a repeated request for the same id can never succeed.
    pub fn is_deterministic_failure(self) -> bool {
        matches!(self, Self::NotOwner | Self::Nonexistent)
    }
}
