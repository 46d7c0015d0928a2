//! Ciphertext message formats.

use pinpoint_proto::{IdentityKey, ProtocolError, RegistrationId, decode_cbor, encode_cbor};
use serde::{Deserialize, Serialize};

use crate::ratchet::Header;

/// A ratchet message for an established session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardMessage {
    /// Ratchet header.
    pub header: Header,
    /// AEAD ciphertext.
    pub ciphertext: Vec<u8>,
}

/// The first message of a session, carrying what the responder needs to
/// complete the handshake offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    /// Sender's registration id.
    pub registration_id: RegistrationId,
    /// One-time prekey consumed, if the bundle carried one.
    pub prekey_id: Option<u32>,
    /// Signed prekey used.
    pub signed_prekey_id: u32,
    /// Sender's handshake base key.
    pub base_key: [u8; 32],
    /// Sender's long-term identity.
    pub identity_key: IdentityKey,
    /// Embedded first ratchet message.
    pub message: StandardMessage,
}

/// Either message type, as carried on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiphertextMessage {
    /// Session-establishing message.
    PreKey(PreKeyMessage),
    /// Message on an existing session.
    Standard(StandardMessage),
}

impl CiphertextMessage {
    /// True for session-establishing messages.
    pub fn is_prekey(&self) -> bool {
        matches!(self, Self::PreKey(_))
    }

    /// Serialize for the relay.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_cbor(self)
    }

    /// Parse relay bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_cbor(bytes)
    }
}
