//! Extended triple Diffie-Hellman handshake.
//!
//! The initiator combines its identity and a fresh base key with the
//! responder's identity, signed prekey and (optionally) one-time prekey. Both
//! sides derive the same root secret without the responder being online.

use rand_core::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    kdf::handshake_secret,
    keys::{IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord},
};

/// Output of the initiator side.
pub(crate) struct Initiated {
    /// Shared root secret.
    pub secret: [u8; 32],
    /// Public base key sent to the responder.
    pub base_key: [u8; 32],
}

/// Run the handshake as initiator against a responder's published keys.
pub(crate) fn initiate<R: RngCore + CryptoRng>(
    identity: &IdentityKeyPair,
    their_identity_dh: &[u8; 32],
    their_signed_prekey: &[u8; 32],
    their_one_time_prekey: Option<&[u8; 32]>,
    rng: &mut R,
) -> Initiated {
    let base = StaticSecret::random_from_rng(&mut *rng);
    let base_key = PublicKey::from(&base).to_bytes();

    let signed = PublicKey::from(*their_signed_prekey);
    let mut outputs = vec![
        identity.dh().diffie_hellman(&signed).to_bytes(),
        base.diffie_hellman(&PublicKey::from(*their_identity_dh)).to_bytes(),
        base.diffie_hellman(&signed).to_bytes(),
    ];
    if let Some(one_time) = their_one_time_prekey {
        outputs.push(base.diffie_hellman(&PublicKey::from(*one_time)).to_bytes());
    }

    Initiated { secret: handshake_secret(&outputs), base_key }
}

/// Run the handshake as responder using locally held private keys.
pub(crate) fn respond(
    identity: &IdentityKeyPair,
    signed_prekey: &SignedPreKeyRecord,
    one_time_prekey: Option<&PreKeyRecord>,
    their_identity_dh: &[u8; 32],
    their_base_key: &[u8; 32],
) -> [u8; 32] {
    let base = PublicKey::from(*their_base_key);
    let mut outputs = vec![
        signed_prekey.dh().diffie_hellman(&PublicKey::from(*their_identity_dh)).to_bytes(),
        identity.dh().diffie_hellman(&base).to_bytes(),
        signed_prekey.dh().diffie_hellman(&base).to_bytes(),
    ];
    if let Some(one_time) = one_time_prekey {
        outputs.push(one_time.dh().diffie_hellman(&base).to_bytes());
    }

    handshake_secret(&outputs)
}
