//! Protocol
//!
//! Wire and data types shared by every Pinpoint crate: peer addresses, public
//! key material published to the directory, relay envelopes, the location
//! payload carried inside ciphertexts, and the closed error taxonomy.
//!
//! All bodies are CBOR-encoded via `ciborium`. Nothing in this crate performs
//! I/O or cryptography.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod address;
mod error;
mod keys;
mod kind;
mod location;
mod relay;
mod remote;

pub use address::{ADDRESS_SEPARATOR, PeerAddress, RegistrationId};
pub use error::ProtocolError;
pub use keys::{DeviceRegistration, IdentityKey, PreKeyBundle, PublicPreKey, PublicSignedPreKey};
pub use kind::ErrorKind;
pub use location::{Location, MessageBody};
pub use relay::{DeleteOutcome, OutboundMessage, RelayMessage};
pub use remote::RemoteError;

/// Encode a value as CBOR.
pub fn encode_cbor<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR value.
pub fn decode_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}
