//! Public key material exchanged with the directory.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{PeerAddress, RegistrationId};

/// Domain separator prepended to signed prekey signing payloads.
const SIGNED_PREKEY_DOMAIN: &[u8] = b"pinpoint-signed-prekey-v1";

/// Long-term public identity of a device.
///
/// Carries the X25519 key used in the handshake and the Ed25519 key used to
/// sign prekeys. A change in either half is an identity change.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    /// X25519 public key.
    pub dh: [u8; 32],
    /// Ed25519 verifying key.
    pub signing: [u8; 32],
}

impl IdentityKey {
    /// Short hex fingerprint for logs and safety-number displays.
    pub fn fingerprint(&self) -> String {
        self.signing[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.fingerprint())
    }
}

/// Public half of a one-time prekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPreKey {
    /// Prekey id, unique per device.
    pub id: u32,
    /// X25519 public key.
    pub public_key: [u8; 32],
}

/// Public half of a signed prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSignedPreKey {
    /// Signed prekey id.
    pub id: u32,
    /// X25519 public key.
    pub public_key: [u8; 32],
    /// Ed25519 signature over [`Self::signing_payload`].
    pub signature: Vec<u8>,
    /// Creation time, unix milliseconds.
    pub created_at_ms: u64,
}

impl PublicSignedPreKey {
    /// Bytes covered by the identity signature.
    pub fn signing_payload(id: u32, public_key: &[u8; 32], created_at_ms: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(SIGNED_PREKEY_DOMAIN.len() + 4 + 32 + 8);
        data.extend_from_slice(SIGNED_PREKEY_DOMAIN);
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(public_key);
        data.extend_from_slice(&created_at_ms.to_be_bytes());
        data
    }
}

/// Everything a sender needs to open a session with an offline recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Device the bundle belongs to.
    pub address: PeerAddress,
    /// Registration id of that device.
    pub registration_id: RegistrationId,
    /// Long-term identity of that device.
    pub identity_key: IdentityKey,
    /// One-time prekey. `None` when the directory's pool is exhausted.
    pub prekey: Option<PublicPreKey>,
    /// Current signed prekey.
    pub signed_prekey: PublicSignedPreKey,
}

/// Request body for registering a new device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    /// Address being registered.
    pub address: PeerAddress,
    /// Locally generated registration id.
    pub registration_id: RegistrationId,
    /// Long-term identity.
    pub identity_key: IdentityKey,
    /// Initial one-time prekey pool.
    pub prekeys: Vec<PublicPreKey>,
    /// Initial signed prekey.
    pub signed_prekey: PublicSignedPreKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_payload_binds_all_fields() {
        let key = [7u8; 32];
        let base = PublicSignedPreKey::signing_payload(1, &key, 10);

        assert_ne!(base, PublicSignedPreKey::signing_payload(2, &key, 10));
        assert_ne!(base, PublicSignedPreKey::signing_payload(1, &[8u8; 32], 10));
        assert_ne!(base, PublicSignedPreKey::signing_payload(1, &key, 11));
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let key = IdentityKey { dh: [0; 32], signing: [0xab; 32] };
        assert_eq!(key.fingerprint(), "abababababababab");
    }
}
