//! Private key material: identity, one-time prekeys, signed prekeys.
//!
//! Records serialize their secret halves so the secure store can persist
//! them. All secrets are zeroized on drop.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pinpoint_proto::{IdentityKey, PublicPreKey, PublicSignedPreKey, RegistrationId};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::CryptoError;

/// Upper bound (inclusive) for generated registration ids.
const MAX_REGISTRATION_ID: u32 = 16_380;

/// Long-term identity of the local device.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    dh_secret: [u8; 32],
    signing_secret: [u8; 32],
}

impl IdentityKeyPair {
    /// Generate a fresh identity.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut dh_secret = [0u8; 32];
        let mut signing_secret = [0u8; 32];
        rng.fill_bytes(&mut dh_secret);
        rng.fill_bytes(&mut signing_secret);
        Self { dh_secret, signing_secret }
    }

    /// Public identity published to the directory.
    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            dh: PublicKey::from(&self.dh()).to_bytes(),
            signing: SigningKey::from_bytes(&self.signing_secret).verifying_key().to_bytes(),
        }
    }

    /// Sign `payload` with the identity signing key.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.signing_secret).sign(payload).to_bytes().to_vec()
    }

    pub(crate) fn dh(&self) -> StaticSecret {
        StaticSecret::from(self.dh_secret)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public()).finish_non_exhaustive()
    }
}

impl Drop for IdentityKeyPair {
    fn drop(&mut self) {
        self.dh_secret.zeroize();
        self.signing_secret.zeroize();
    }
}

/// A one-time prekey held locally until an inbound handshake consumes it.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    /// Prekey id.
    pub id: u32,
    secret: [u8; 32],
}

impl PreKeyRecord {
    /// Generate a prekey with the given id.
    pub fn generate<R: RngCore + CryptoRng>(id: u32, rng: &mut R) -> Self {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self { id, secret }
    }

    /// Public half for upload.
    pub fn public(&self) -> PublicPreKey {
        PublicPreKey { id: self.id, public_key: PublicKey::from(&self.dh()).to_bytes() }
    }

    pub(crate) fn dh(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

impl fmt::Debug for PreKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreKeyRecord").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Drop for PreKeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// A medium-term prekey signed by the identity key.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Signed prekey id.
    pub id: u32,
    /// Creation time, unix milliseconds.
    pub created_at_ms: u64,
    signature: Vec<u8>,
    secret: [u8; 32],
}

impl SignedPreKeyRecord {
    /// Generate and sign a new signed prekey.
    pub fn generate<R: RngCore + CryptoRng>(
        identity: &IdentityKeyPair,
        id: u32,
        created_at_ms: u64,
        rng: &mut R,
    ) -> Self {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        let public_key = PublicKey::from(&StaticSecret::from(secret)).to_bytes();
        let payload = PublicSignedPreKey::signing_payload(id, &public_key, created_at_ms);
        let signature = identity.sign(&payload);
        Self { id, created_at_ms, signature, secret }
    }

    /// Public half for upload.
    pub fn public(&self) -> PublicSignedPreKey {
        PublicSignedPreKey {
            id: self.id,
            public_key: PublicKey::from(&self.dh()).to_bytes(),
            signature: self.signature.clone(),
            created_at_ms: self.created_at_ms,
        }
    }

    /// Age relative to `now_ms`. Saturates at zero for clocks that went back.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    pub(crate) fn dh(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

impl fmt::Debug for SignedPreKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedPreKeyRecord")
            .field("id", &self.id)
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

impl Drop for SignedPreKeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Generate `count` prekeys with sequential ids starting at `start_id`.
pub fn generate_prekeys<R: RngCore + CryptoRng>(
    start_id: u32,
    count: u32,
    rng: &mut R,
) -> Vec<PreKeyRecord> {
    (0..count).map(|offset| PreKeyRecord::generate(start_id.wrapping_add(offset), rng)).collect()
}

/// Generate a registration id in `1..=16380`.
pub fn generate_registration_id<R: RngCore + CryptoRng>(rng: &mut R) -> RegistrationId {
    rng.next_u32() % MAX_REGISTRATION_ID + 1
}

/// Verify a signed prekey against the identity that published it.
pub fn verify_signed_prekey(
    identity: &IdentityKey,
    signed_prekey: &PublicSignedPreKey,
) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(&identity.signing).map_err(|_| CryptoError::InvalidSignature)?;
    let signature =
        Signature::from_slice(&signed_prekey.signature).map_err(|_| CryptoError::InvalidSignature)?;
    let payload = PublicSignedPreKey::signing_payload(
        signed_prekey.id,
        &signed_prekey.public_key,
        signed_prekey.created_at_ms,
    );

    verifying_key.verify(&payload, &signature).map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use rand_chacha::{ChaCha20Rng, rand_core::SeedableRng};

    use super::*;

    #[test]
    fn signed_prekey_verifies_against_its_identity() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let identity = IdentityKeyPair::generate(&mut rng);
        let signed = SignedPreKeyRecord::generate(&identity, 7, 1_000, &mut rng);

        assert_eq!(verify_signed_prekey(&identity.public(), &signed.public()), Ok(()));
    }

    #[test]
    fn signed_prekey_rejects_other_identity() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let identity = IdentityKeyPair::generate(&mut rng);
        let other = IdentityKeyPair::generate(&mut rng);
        let signed = SignedPreKeyRecord::generate(&identity, 7, 1_000, &mut rng);

        assert_eq!(
            verify_signed_prekey(&other.public(), &signed.public()),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn tampered_timestamp_fails_verification() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let identity = IdentityKeyPair::generate(&mut rng);
        let mut public = SignedPreKeyRecord::generate(&identity, 1, 1_000, &mut rng).public();
        public.created_at_ms += 1;

        assert!(verify_signed_prekey(&identity.public(), &public).is_err());
    }

    #[test]
    fn prekeys_are_sequential() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let ids: Vec<u32> = generate_prekeys(10, 5, &mut rng).iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn registration_ids_stay_in_range() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        for _ in 0..1_000 {
            let id = generate_registration_id(&mut rng);
            assert!((1..=MAX_REGISTRATION_ID).contains(&id));
        }
    }
}
