//! Key derivation for the handshake and the ratchet chains.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HKDF info for the handshake master secret.
const HANDSHAKE_INFO: &[u8] = b"pinpoint-x3dh-v1";

/// HKDF info for root key steps.
const ROOT_INFO: &[u8] = b"pinpoint-ratchet-root-v1";

/// HKDF info for expanding a message key into AEAD key and nonce.
const MESSAGE_INFO: &[u8] = b"pinpoint-message-keys-v1";

/// Chain label for deriving a message key
const MESSAGE_LABEL: &[u8] = &[0x01];

/// Chain label for deriving the next chain key
const CHAIN_LABEL: &[u8] = &[0x02];

/// Combine handshake DH outputs into the initial root secret.
///
/// The 32 `0xFF` bytes prefix keeps the input distinct from any single
/// X25519 output.
pub(crate) fn handshake_secret(dh_outputs: &[[u8; 32]]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(32 + dh_outputs.len() * 32);
    ikm.extend_from_slice(&[0xFF; 32]);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
    let mut secret = [0u8; 32];
    let Ok(()) = hkdf.expand(HANDSHAKE_INFO, &mut secret) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    secret
}

/// One root ratchet step: `(root, dh) -> (new_root, chain)`.
pub(crate) fn kdf_root(root: &[u8; 32], dh: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(Some(root), dh);
    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(ROOT_INFO, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    (new_root, chain)
}

/// One symmetric chain step: `chain -> (next_chain, message_key)`.
pub(crate) fn kdf_chain(chain: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    (hmac_label(chain, CHAIN_LABEL), hmac_label(chain, MESSAGE_LABEL))
}

/// Expand a message key into an AEAD key and a 24-byte nonce.
pub(crate) fn message_keys(message_key: &[u8; 32]) -> ([u8; 32], [u8; 24]) {
    let hkdf = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 56];
    let Ok(()) = hkdf.expand(MESSAGE_INFO, &mut okm) else {
        unreachable!("56 bytes is a valid HKDF-SHA256 output length");
    };

    let mut key = [0u8; 32];
    let mut nonce = [0u8; 24];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    (key, nonce)
}

fn hmac_label(key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    let result = mac.finalize().into_bytes();

    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}
