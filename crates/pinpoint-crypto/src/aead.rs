//! Message sealing with `XChaCha20-Poly1305`.
//!
//! Every message key is used exactly once, so the AEAD key and nonce are both
//! derived from it and no randomness is needed here.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::Zeroize;

use crate::{CryptoError, kdf::message_keys};

/// Encrypt `plaintext` under a one-time message key.
pub(crate) fn seal(message_key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let (mut key, nonce) = message_keys(message_key);
    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt and authenticate a ciphertext produced by [`seal`].
pub(crate) fn open(
    message_key: &[u8; 32],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let (mut key, nonce) = message_keys(message_key);
    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();

    cipher
        .decrypt(XNonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}
